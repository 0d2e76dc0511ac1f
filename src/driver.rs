//! Driver spawns and manages the telemetry polling task

use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::provider::TelemetrySource;
use crate::stream::CoalesceExt;
use crate::telemetry::TelemetryStore;
use crate::types::UpdateRate;

/// Consecutive source errors tolerated before polling stops.
const MAX_ERRORS: u32 = 10;

/// Result of spawning the driver task
pub struct DriverChannels {
    /// Item count of the store after every append; closed when polling ends
    pub item_count: watch::Receiver<usize>,
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
}

/// Driver spawns the task that moves samples from a source into a store
pub struct Driver;

impl Driver {
    /// Spawn the polling task. Must be called inside a tokio runtime.
    pub fn spawn<S>(source: S, store: Arc<TelemetryStore>) -> DriverChannels
    where
        S: TelemetrySource,
    {
        let (count_tx, count_rx) = watch::channel(store.item_count());
        let cancel = CancellationToken::new();
        let cancel_task = cancel.clone();

        tokio::spawn(async move {
            Self::poll_task(source, store, count_tx, cancel_task).await;
        });

        DriverChannels { item_count: count_rx, cancel }
    }

    async fn poll_task<S>(
        mut source: S,
        store: Arc<TelemetryStore>,
        count_tx: watch::Sender<usize>,
        cancel: CancellationToken,
    ) where
        S: TelemetrySource,
    {
        info!("Telemetry poll task started");
        let mut sample_count = 0u64;
        let mut error_count = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Telemetry polling cancelled");
                    break;
                }
                result = source.next_sample() => result,
            };

            match result {
                Ok(Some(sample)) => {
                    sample_count += 1;
                    error_count = 0;
                    let index = store.add_snapshot(sample);
                    trace!("Sample {} stored at index {}", sample_count, index);

                    if count_tx.send(index + 1).is_err() {
                        debug!("Item count receivers dropped, shutting down");
                        break;
                    }
                }
                Ok(None) => {
                    info!("Telemetry source ended after {} samples", sample_count);
                    break;
                }
                Err(e) => {
                    error_count += 1;
                    error!("Telemetry source error ({}/{}): {}", error_count, MAX_ERRORS, e);

                    if error_count >= MAX_ERRORS {
                        error!("Too many telemetry errors, stopping");
                        break;
                    }

                    // Exponential backoff: 100ms, 200ms, 400ms, ...
                    let backoff = Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!("Telemetry poll task ended (stored {} samples)", sample_count);
    }
}

/// Running telemetry collection: the store, its driver and update notifications.
pub struct TelemetryMonitor {
    store: Arc<TelemetryStore>,
    item_count: watch::Receiver<usize>,
    sample_period: Duration,
    cancel: CancellationToken,
}

impl TelemetryMonitor {
    /// Starts polling `source` into `store`.
    pub fn start<S>(source: S, store: Arc<TelemetryStore>) -> Self
    where
        S: TelemetrySource,
    {
        let sample_period = source.sample_period();
        let channels = Driver::spawn(source, Arc::clone(&store));
        info!("Telemetry monitor started ({:?} period)", sample_period);
        Self { store, item_count: channels.item_count, sample_period, cancel: channels.cancel }
    }

    /// Item counts after new samples, at most as often as `rate` allows.
    ///
    /// The stream ends when polling stops.
    pub fn updates(&self, rate: UpdateRate) -> BoxStream<'static, usize> {
        let counts = WatchStream::from_changes(self.item_count.clone());
        match rate.interval(self.sample_period) {
            None => counts.boxed(),
            Some(period) => counts.coalesce(period).boxed(),
        }
    }

    pub fn item_count(&self) -> usize {
        *self.item_count.borrow()
    }

    /// Waits until at least `count` samples are stored.
    ///
    /// Returns `false` if polling stopped first.
    pub async fn wait_for(&self, count: usize) -> bool {
        let mut item_count = self.item_count.clone();
        item_count.wait_for(|&n| n >= count).await.is_ok()
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    pub fn sample_period(&self) -> Duration {
        self.sample_period
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.item_count.has_changed().is_err()
    }
}

impl Drop for TelemetryMonitor {
    fn drop(&mut self) {
        debug!("Dropping telemetry monitor");
        self.cancel.cancel();
    }
}
