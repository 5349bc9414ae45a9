//! Kernel configuration
//!
//! Tunables for the process kernel, loadable from TOML files. Every field
//! has a sensible default so an empty file (or `KernelConfig::default()`)
//! yields a working kernel.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{KernelError, Result};

/// Configuration for directors, receivers, and branch controllers.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct KernelConfig {
    /// Capacity of every receiver queue created by a director's receiver
    /// factory. A capacity of 1 gives rendezvous-like mailbox behavior;
    /// larger values buffer tokens before blocking the producer.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a branch controller sleeps between transfer attempts once
    /// all of its branches report blocked. Deactivation wakes the
    /// controller immediately; this interval only bounds transfer latency.
    #[serde(default = "default_controller_poll_ms")]
    pub controller_poll_ms: u64,
}

fn default_queue_capacity() -> usize {
    1
}

fn default_controller_poll_ms() -> u64 {
    2
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            controller_poll_ms: default_controller_poll_ms(),
        }
    }
}

impl KernelConfig {
    /// The controller poll interval as a [`Duration`].
    pub fn controller_poll(&self) -> Duration {
        Duration::from_millis(self.controller_poll_ms)
    }
}

/// Load kernel configuration from a TOML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<KernelConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| KernelError::ConfigIo {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let config: KernelConfig = toml::from_str(&raw).map_err(|e| KernelError::ConfigParse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    debug!(
        path = %path.display(),
        queue_capacity = config.queue_capacity,
        controller_poll_ms = config.controller_poll_ms,
        "loaded kernel configuration"
    );
    Ok(config)
}
