//! Source trait for telemetry samples

use std::time::Duration;

use crate::Result;
use crate::telemetry::TelemetrySample;

/// A producer of telemetry samples.
///
/// Sources pace themselves: the agent source polls on its interval, a replay source at
/// its recorded period.
#[async_trait::async_trait]
pub trait TelemetrySource: Send + 'static {
    /// Waits for the next sample.
    ///
    /// Returns:
    /// - `Ok(Some(sample))` - New sample available
    /// - `Ok(None)` - Source ended (normal termination)
    /// - `Err(e)` - Error occurred; the driver retries with backoff
    async fn next_sample(&mut self) -> Result<Option<TelemetrySample>>;

    /// Time between two samples.
    fn sample_period(&self) -> Duration;
}
