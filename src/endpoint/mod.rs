//! Per-endpoint admission control and request serving — the `proxy`/
//! `respond` state machine.

pub mod handler;

pub use handler::{ConnState, EndpointGuard, EndpointHandler, EndpointSnapshot};
