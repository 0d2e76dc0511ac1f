//! Telemetry source polling the agent

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, trace};

use crate::error::{ProfilerError, SessionError};
use crate::provider::TelemetrySource;
use crate::session::Connection;
use crate::telemetry::TelemetrySample;
use crate::wire::{Command, Response, SimpleCommand};
use crate::Result;

/// Polls `GetMonitoredNumbers` over a live connection.
pub struct AgentSource {
    connection: Arc<Connection>,
    interval: Interval,
    period: Duration,
    polls: u64,
}

impl AgentSource {
    pub fn new(connection: Arc<Connection>, period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = interval(period);
        // Polls that took longer than a period are not made up for.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { connection, interval, period, polls: 0 }
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }
}

#[async_trait::async_trait]
impl TelemetrySource for AgentSource {
    async fn next_sample(&mut self) -> Result<Option<TelemetrySample>> {
        self.interval.tick().await;
        if self.connection.is_closed() {
            debug!("Connection closed, telemetry polling ends");
            return Ok(None);
        }

        self.polls += 1;
        let response =
            match self.connection.request(Command::Simple(SimpleCommand::GetMonitoredNumbers)).await {
                Ok(response) => response,
                Err(ProfilerError::Session(SessionError::Closed)) => {
                    debug!("Connection closed during telemetry poll {}", self.polls);
                    return Ok(None);
                }
                Err(e) if e.is_session_ending() && self.connection.is_closed() => {
                    debug!("Connection lost during telemetry poll {}: {}", self.polls, e);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

        match response {
            Response::MonitoredNumbers(numbers) => {
                let sample = TelemetrySample::try_from(numbers)?;
                trace!("Telemetry poll {}: timestamp={}", self.polls, sample.timestamp);
                Ok(Some(sample))
            }
            Response::Status(status) if !status.ok => Err(ProfilerError::Agent {
                message: status.error_message.unwrap_or_else(|| "telemetry refused".to_string()),
            }),
            other => Err(ProfilerError::unexpected_response("MonitoredNumbers", other.name())),
        }
    }

    fn sample_period(&self) -> Duration {
        self.period
    }
}
