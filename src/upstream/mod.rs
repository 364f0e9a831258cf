pub mod supervisor;

pub use supervisor::{Availability, Gate, UpstreamSupervisor};
