//! Replay source for recorded telemetry

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tokio::time::{Interval, interval};
use tracing::{debug, info, trace};

use serde::{Deserialize, Serialize};

use crate::error::ProfilerError;
use crate::provider::TelemetrySource;
use crate::telemetry::TelemetrySample;
use crate::Result;

/// On-disk form of a telemetry recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    /// Period the samples were taken at, in milliseconds
    pub period_ms: u64,
    pub samples: Vec<TelemetrySample>,
}

impl Recording {
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml_ng::from_str(yaml).map_err(|e| ProfilerError::Telemetry {
            details: format!("invalid recording: {e}"),
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self).map_err(|e| ProfilerError::Telemetry {
            details: format!("recording not serializable: {e}"),
        })
    }
}

/// Replays recorded samples at their recorded period.
pub struct ReplaySource {
    samples: VecDeque<TelemetrySample>,
    total: usize,
    period: Duration,
    speed: f64,
    interval: Interval,
}

impl ReplaySource {
    pub fn new(samples: Vec<TelemetrySample>, period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let total = samples.len();
        Self { samples: samples.into(), total, period, speed: 1.0, interval: interval(period) }
    }

    pub fn from_recording(recording: Recording) -> Self {
        Self::new(recording.samples, Duration::from_millis(recording.period_ms))
    }

    /// Loads a YAML recording.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|source| ProfilerError::ConfigFile { path: path.to_path_buf(), source })?;
        let recording = Recording::parse(&yaml)?;
        info!(
            "Opened telemetry recording {}: {} samples every {}ms",
            path.display(),
            recording.samples.len(),
            recording.period_ms
        );
        Ok(Self::from_recording(recording))
    }

    /// Set playback speed
    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed.clamp(0.1, 100.0);
        self.interval = interval(self.period.div_f64(self.speed));
        debug!("Playback speed set to {}x", self.speed);
    }

    pub fn remaining(&self) -> usize {
        self.samples.len()
    }

    /// Recorded duration
    pub fn duration(&self) -> Duration {
        self.period * u32::try_from(self.total).unwrap_or(u32::MAX)
    }
}

#[async_trait::async_trait]
impl TelemetrySource for ReplaySource {
    async fn next_sample(&mut self) -> Result<Option<TelemetrySample>> {
        if self.samples.is_empty() {
            debug!("Reached end of replay");
            return Ok(None);
        }

        self.interval.tick().await;

        let sample = self.samples.pop_front();
        trace!("Replay sample {}/{}", self.total - self.samples.len(), self.total);
        Ok(sample)
    }

    fn sample_period(&self) -> Duration {
        self.period
    }
}
