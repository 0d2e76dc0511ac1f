//! Telemetry source implementations

pub mod agent;
pub mod replay;

pub use agent::AgentSource;
pub use replay::{Recording, ReplaySource};
