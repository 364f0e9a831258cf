//! Prometheus metrics registration and rendering.

pub mod registry;

pub use registry::Metrics;
