// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Loaded from TOML (every key optional) or from the environment.
//!
//! ```toml
//! executor = "parallel"
//! thread_name_prefix = "worker"
//! flush_backoff_max_us = 500
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::executor::ExecutorKind;
use crate::timer::MAX_SLEEP_MS;

/// Environment variable selecting the executor.
pub const EXECUTOR_ENV: &str = "TANDEM_EXECUTOR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub executor: ExecutorKind,
    /// Name prefix for task threads of the parallel executor.
    pub thread_name_prefix: String,
    /// Upper bound of the parallel `flush` polling backoff.
    pub flush_backoff_max_us: u64,
    /// Longest accepted `sleep_ms` duration.
    pub max_sleep_ms: u64,
    /// How long a root caller of the cooperative executor sleeps between
    /// checks while only timers can make progress.
    pub root_poll_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::Cooperative,
            thread_name_prefix: "tandem-task".to_string(),
            flush_backoff_max_us: 1000,
            max_sleep_ms: MAX_SLEEP_MS,
            root_poll_ms: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(src)?)
    }

    /// Defaults, with the executor overridden by `TANDEM_EXECUTOR` if set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(name) = std::env::var(EXECUTOR_ENV) {
            config.executor = parse_executor(&name)?;
        }
        Ok(config)
    }

    pub fn with_executor(mut self, executor: ExecutorKind) -> Self {
        self.executor = executor;
        self
    }
}

/// Parse an executor name, case-insensitively.
pub fn parse_executor(name: &str) -> Result<ExecutorKind, ConfigError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "parallel" | "threads" => Ok(ExecutorKind::Parallel),
        "cooperative" | "serial" => Ok(ExecutorKind::Cooperative),
        other => Err(ConfigError::UnknownExecutor(other.to_string())),
    }
}
