//! Profiler configuration
//!
//! Loaded from YAML; every section is optional.
//!
//! ```yaml
//! agent:
//!   address: "127.0.0.1:5140"
//!   request_timeout_ms: 30000
//! instrumentation:
//!   mode: recursive_full
//!   root_selectors:
//!     - class: "com.example.**"
//!     - { class: "com.example.Main", method: "main" }
//! marks:
//!   - name: Persistence
//!     selectors: ["com.example.db.", "org.hibernate."]
//!   - name: Rendering
//!     selectors: ["com.example.ui."]
//! telemetry:
//!   chunk_size: 50
//!   poll_interval_ms: 1000
//!   display_rate: { every_millis: 5000 }
//! logging:
//!   filter: "jfluid=debug,info"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::ProfilerError;
use crate::session::DEFAULT_REQUEST_TIMEOUT;
use crate::telemetry::DEFAULT_CHUNK_SIZE;
use crate::types::{InstrumentationType, Mark, MarkMapping, RootSelector, UpdateRate};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilerConfig {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub instrumentation: InstrumentationConfig,

    /// Mark categories in matching order.
    #[serde(default)]
    pub marks: Vec<MarkCategory>,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Agent connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Address the agent listens on. Default: "127.0.0.1:5140".
    #[serde(default = "default_agent_address")]
    pub address: String,

    /// How long a request may wait for its response. Default: 30s.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { address: default_agent_address(), request_timeout_ms: default_request_timeout_ms() }
    }
}

impl AgentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentationConfig {
    /// Default: recursive_full.
    #[serde(default = "default_instrumentation_mode")]
    pub mode: InstrumentationType,

    #[serde(default)]
    pub root_selectors: Vec<RootSelector>,

    /// Instrument threads started by the profiled roots. Default: true.
    #[serde(default = "default_true")]
    pub instrument_spawned_threads: bool,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            mode: default_instrumentation_mode(),
            root_selectors: Vec::new(),
            instrument_spawned_threads: true,
        }
    }
}

/// A named mark and the flattened-signature prefixes that select it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkCategory {
    pub name: String,
    pub selectors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Rows per storage chunk. Default: 50.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Agent polling period. Default: 1s.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often update notifications are delivered. Default: every sample.
    #[serde(default)]
    pub display_rate: UpdateRate,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            poll_interval_ms: default_poll_interval_ms(),
            display_rate: UpdateRate::default(),
        }
    }
}

impl TelemetryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives. `RUST_LOG` takes precedence when set. Default: "info".
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: default_log_filter() }
    }
}

impl LoggingConfig {
    /// Installs a global `tracing` subscriber.
    ///
    /// Returns `false` when a subscriber was already installed; calling it twice is
    /// harmless.
    pub fn install(&self) -> bool {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init().is_ok()
    }
}

fn default_agent_address() -> String {
    "127.0.0.1:5140".to_string()
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

fn default_instrumentation_mode() -> InstrumentationType {
    InstrumentationType::RecursiveFull
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl ProfilerConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: ProfilerConfig = serde_yaml_ng::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate().with_context(|| format!("validating config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        let cfg: ProfilerConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| ProfilerError::config_error(format!("invalid YAML: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> crate::Result<()> {
        if self.telemetry.chunk_size == 0 {
            return Err(ProfilerError::config_error("telemetry.chunk_size must be positive"));
        }

        if self.telemetry.poll_interval_ms == 0 {
            return Err(ProfilerError::config_error("telemetry.poll_interval_ms must be positive"));
        }

        if self.agent.request_timeout_ms == 0 {
            return Err(ProfilerError::config_error("agent.request_timeout_ms must be positive"));
        }

        if self.marks.len() >= usize::from(u16::MAX) {
            return Err(ProfilerError::config_error(format!(
                "too many mark categories ({})",
                self.marks.len()
            )));
        }

        let mut names = HashSet::new();
        for (i, category) in self.marks.iter().enumerate() {
            if category.name.trim().is_empty() {
                return Err(ProfilerError::config_error(format!("marks[{i}].name is empty")));
            }
            if !names.insert(category.name.as_str()) {
                return Err(ProfilerError::config_error(format!(
                    "mark category {} is defined twice",
                    category.name
                )));
            }
            if category.selectors.iter().any(|s| s.is_empty()) {
                return Err(ProfilerError::config_error(format!(
                    "mark category {} has an empty selector prefix",
                    category.name
                )));
            }
        }

        for (i, selector) in self.instrumentation.root_selectors.iter().enumerate() {
            if selector.class_prefix_str().is_empty() {
                return Err(ProfilerError::config_error(format!(
                    "instrumentation.root_selectors[{i}] has an empty class prefix"
                )));
            }
        }

        Ok(())
    }

    /// Mark mappings in category order plus the display label of every mark.
    ///
    /// Categories are numbered from 1 in the order they are listed.
    pub fn mark_configuration(&self) -> (Vec<MarkMapping>, HashMap<Mark, String>) {
        let mut mappings = Vec::new();
        let mut labels = HashMap::new();
        for (id, category) in (1u16..).zip(&self.marks) {
            let mark = Mark::new(id);
            labels.insert(mark, category.name.clone());
            mappings.extend(category.selectors.iter().map(|s| MarkMapping::new(s.clone(), mark)));
        }
        (mappings, labels)
    }
}
