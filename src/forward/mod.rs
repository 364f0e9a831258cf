//! Forwarding a proxy-type endpoint's admitted requests to its bound
//! upstream: a shared, process-wide HTTP client plus the bounded
//! retry/wait loop that only sends once the upstream is `Available` and
//! `Open`.

pub mod transport;

pub use transport::{empty_body, full_body, BoxBody, ForwardOutcome, ForwardRequest, ReverseProxy};
