//! Bridge configuration
//!
//! Every knob has a default tuned for the common production case: no viewer
//! attached, a handful of producer threads, zones a few dozen levels deep.
//!
//! Sources, later ones winning:
//! 1. [`BridgeConfig::default`]
//! 2. a TOML file named by `MEGATRACE_CONFIG`
//! 3. `MEGATRACE_SINK` (`tcp:<addr>`, `file:<path>` or `null`)
//!
//! ```toml
//! queue_capacity = 16384
//! max_zone_depth = 256
//! depth_policy = "coarsen"
//!
//! [sink]
//! kind = "tcp"
//! address = "127.0.0.1:8086"
//! ```

use crate::call_stack::DepthPolicy;
use crate::error::BridgeError;
use crate::wire::MAX_EVENTS_PER_FRAME;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a TOML configuration file
pub const CONFIG_ENV: &str = "MEGATRACE_CONFIG";
/// Environment variable overriding the sink
pub const SINK_ENV: &str = "MEGATRACE_SINK";

/// Where the event stream goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Outbound TCP connection to a viewer
    Tcp { address: String },
    /// Append the stream to a file
    File { path: PathBuf },
    /// Discard everything (tracing compiled in but unused)
    Null,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Tcp {
            address: "127.0.0.1:8086".to_string(),
        }
    }
}

impl SinkConfig {
    /// Parse the `MEGATRACE_SINK` syntax
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec == "null" {
            return Ok(SinkConfig::Null);
        }
        match spec.split_once(':') {
            Some(("tcp", address)) if !address.is_empty() => Ok(SinkConfig::Tcp {
                address: address.to_string(),
            }),
            Some(("file", path)) if !path.is_empty() => Ok(SinkConfig::File {
                path: PathBuf::from(path),
            }),
            _ => anyhow::bail!(
                "Invalid sink '{}' (expected tcp:<addr>, file:<path> or null)",
                spec
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Records per producer-thread ring
    pub queue_capacity: usize,
    /// Deepest zone nesting that is recorded
    pub max_zone_depth: u32,
    pub depth_policy: DepthPolicy,
    pub sink: SinkConfig,
    /// Records drained per ring per worker pass
    pub batch_size: usize,
    /// Worker idle wait
    pub poll_interval_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Bound on draining in-flight records at shutdown
    pub shutdown_grace_ms: u64,
    /// Event frames kept while no sink is connected
    pub disconnected_buffer_bytes: usize,
    pub dropped_report_interval_ms: u64,
    /// Live allocations remembered for matching frees
    pub alloc_tracking_capacity: usize,
    /// Recent usage errors kept for draining
    pub diagnostics_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            queue_capacity: 16 * 1024,
            max_zone_depth: 256,
            depth_policy: DepthPolicy::Coarsen,
            sink: SinkConfig::default(),
            batch_size: 512,
            poll_interval_ms: 2,
            reconnect_initial_ms: 250,
            reconnect_max_ms: 5_000,
            connect_timeout_ms: 250,
            write_timeout_ms: 500,
            shutdown_grace_ms: 1_000,
            disconnected_buffer_bytes: 4 * 1024 * 1024,
            dropped_report_interval_ms: 100,
            alloc_tracking_capacity: 1 << 20,
            diagnostics_capacity: 256,
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: BridgeConfig =
            toml::from_str(content).context("Failed to parse TOML bridge configuration")?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read bridge configuration: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
            .with_context(|| format!("In bridge configuration {}", path.as_ref().display()))
    }

    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_ENV).filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::from_file(path.trim())?,
            None => Self::default(),
        };

        if let Some(sink) = lookup(SINK_ENV).filter(|s| !s.trim().is_empty()) {
            config.sink = SinkConfig::parse(&sink)
                .with_context(|| format!("Invalid {} value", SINK_ENV))?;
        }

        Ok(config)
    }

    pub fn with_sink(mut self, sink: SinkConfig) -> Self {
        self.sink = sink;
        self
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        let invalid = |msg: &str| Err(BridgeError::InvalidConfig(msg.to_string()));

        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be > 0");
        }
        if self.max_zone_depth == 0 {
            return invalid("max_zone_depth must be > 0");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be > 0");
        }
        if self.batch_size > MAX_EVENTS_PER_FRAME {
            return invalid("batch_size exceeds the records one Events frame can carry");
        }
        if self.diagnostics_capacity == 0 {
            return invalid("diagnostics_capacity must be > 0");
        }
        if self.reconnect_initial_ms == 0 {
            return invalid("reconnect_initial_ms must be > 0");
        }
        if self.reconnect_initial_ms > self.reconnect_max_ms {
            return invalid("reconnect_initial_ms must not exceed reconnect_max_ms");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }

    pub fn dropped_report_interval(&self) -> Duration {
        Duration::from_millis(self.dropped_report_interval_ms)
    }
}
