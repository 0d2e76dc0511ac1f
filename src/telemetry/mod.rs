//! Telemetry aggregation.
//!
//! [`TelemetrySample`]s polled from the agent are appended to a [`TelemetryStore`],
//! which keeps them in chunked columns and pairs GC start/finish events that straddle
//! snapshots into [`GcInterval`]s.

mod gc;
mod sample;
mod store;

pub use gc::GcInterval;
pub use sample::TelemetrySample;
pub use store::{DEFAULT_CHUNK_SIZE, TelemetryStore};
