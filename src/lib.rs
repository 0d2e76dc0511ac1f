//! Profiler-side core of a dynamic Java profiler.
//!
//! JFluid talks to an agent running inside the target JVM over a framed binary protocol,
//! decides which methods get instrumented as classes load, attributes call-tree time to
//! user-defined marks and keeps a telemetry history of the target VM.
//!
//! # Features
//!
//! - **Wire protocol**: typed commands and responses with a `tokio_util` codec
//! - **Instrumentation**: root method selection and class-load driven rewriting
//! - **Marks**: method-to-category attribution over the calling-context tree
//! - **Telemetry**: chunked, GC-paired snapshot history with rate-limited updates
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use jfluid::{InstrumentError, Instrumentor, JFluid, ProfilerConfig, RootSelector, UpdateRate};
//!
//! struct Rewriter;
//!
//! impl Instrumentor for Rewriter {
//!     fn instrument(
//!         &self,
//!         _class_name: &str,
//!         _class_bytes: &[u8],
//!         _selectors: &[RootSelector],
//!     ) -> Result<Option<Vec<u8>>, InstrumentError> {
//!         Ok(None)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProfilerConfig::load(std::path::Path::new("profiler.yaml"))?;
//!     let client = JFluid::from_config(Arc::new(Rewriter), config).await?;
//!     client.initiate_profiling().await?;
//!
//!     let monitor = client.start_telemetry();
//!     let mut updates = monitor.updates(UpdateRate::EveryMillis(1_000));
//!     while let Some(count) = updates.next().await {
//!         if let Some(latest) = monitor.store().latest() {
//!             println!("{count} samples, {} bytes used", latest.used_memory());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Protocol and transport
pub mod classfile;
pub mod session;
pub mod wire;

// Profiling engines
pub mod cct;
pub mod instrumentation;
pub mod marking;
pub mod telemetry;

// Stream-based telemetry architecture
pub mod driver;
pub mod provider;
pub mod providers;
pub mod stream;

pub mod client;
pub mod config;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use cct::{CallTree, MarkTimeCollector};
pub use client::{ProfilerClient, ProfilerEvent};
pub use config::ProfilerConfig;
pub use driver::TelemetryMonitor;
pub use instrumentation::{InstrumentationCoordinator, Instrumentor, MethodRegistry};
pub use marking::{MarkTracker, MarkingEngine};
pub use provider::TelemetrySource;
pub use session::{Connection, Session};
pub use telemetry::{GcInterval, TelemetrySample, TelemetryStore};

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info};

/// Entry point for profiling sessions.
///
/// The agent listens; the profiler connects. Anything that is not TCP (a Unix socket, an
/// in-process duplex) can be wrapped with [`Session::new`] and handed to
/// [`ProfilerClient::new`] directly.
pub struct JFluid;

impl JFluid {
    /// Connect to the agent at `address` and start a client for it.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::Connection`] if the agent is not reachable.
    pub async fn connect(
        address: &str,
        instrumentor: Arc<dyn Instrumentor>,
        config: ProfilerConfig,
    ) -> Result<ProfilerClient> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            ProfilerError::connection_failed_with_source(
                format!("cannot reach agent at {address}"),
                Box::new(e),
            )
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on agent socket: {}", e);
        }
        info!("Connected to agent at {}", address);
        Ok(ProfilerClient::new(Session::new(stream), instrumentor, config))
    }

    /// Connect to the agent address named in `config`.
    pub async fn from_config(
        instrumentor: Arc<dyn Instrumentor>,
        config: ProfilerConfig,
    ) -> Result<ProfilerClient> {
        config.validate()?;
        let address = config.agent.address.clone();
        Self::connect(&address, instrumentor, config).await
    }
}
