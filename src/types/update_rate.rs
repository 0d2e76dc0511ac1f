//! Display rate for telemetry update notifications

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often consumers want to hear about new telemetry samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateRate {
    /// Every appended sample is reported
    #[default]
    EverySample,

    /// At most one notification per interval, in milliseconds
    EveryMillis(u64),
}

impl UpdateRate {
    /// Normalize against the sampling period: a display interval at or below the
    /// sampling period cannot coalesce anything.
    pub fn normalize(self, sample_period: Duration) -> Self {
        match self {
            UpdateRate::EverySample => UpdateRate::EverySample,
            UpdateRate::EveryMillis(0) => UpdateRate::EverySample,
            UpdateRate::EveryMillis(ms) if Duration::from_millis(ms) <= sample_period => {
                UpdateRate::EverySample
            }
            UpdateRate::EveryMillis(ms) => UpdateRate::EveryMillis(ms),
        }
    }

    /// Coalescing interval if one is needed.
    pub fn interval(self, sample_period: Duration) -> Option<Duration> {
        match self.normalize(sample_period) {
            UpdateRate::EverySample => None,
            UpdateRate::EveryMillis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}
