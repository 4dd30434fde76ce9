// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persisted settings for the `ensembled` daemon.

use std::path::PathBuf;
use std::time::Duration;

use ensemble_jobs::{CoordinatorConfig, RetryPolicy, WorkerCommand};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ConfigService, ConfigStore};

/// Config key the daemon's settings are stored under.
pub const SETTINGS_KEY: &str = "ensembled";

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 29681;

/// Daemon configuration. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Interface to bind.
    pub host: String,
    /// HTTP port.
    pub port: u16,
    /// Root of the durable trajectory cache.
    pub cache_dir: PathBuf,
    /// Root under which per-job workspaces are created.
    pub workspace_root: PathBuf,
    /// Worker process run for every task.
    pub executor: ExecutorSettings,
    /// Job-level retry policy.
    pub retry: RetryPolicy,
    /// Finished jobs kept pollable.
    pub finished_retention: usize,
    /// Delete the cache directory on shutdown.
    pub remove_cache_on_exit: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: DEFAULT_PORT,
            cache_dir: PathBuf::from("cache"),
            workspace_root: PathBuf::from("jobs"),
            executor: ExecutorSettings::default(),
            retry: RetryPolicy::default(),
            finished_retention: 1024,
            remove_cache_on_exit: false,
        }
    }
}

/// How tasks are executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Worker program.
    pub program: PathBuf,
    /// Worker arguments.
    pub args: Vec<String>,
    /// Per-attempt timeout, in seconds.
    pub timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ensemble-worker"),
            args: Vec::new(),
            timeout_secs: 3600,
        }
    }
}

impl ServiceSettings {
    /// Load settings, writing defaults on first run, and validate them.
    pub fn load<S: ConfigStore>(config: &ConfigService<S>) -> Result<Self, ConfigError> {
        let (settings, _) = config.load_or_init::<Self>(SETTINGS_KEY)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            key: SETTINGS_KEY.to_owned(),
            reason: reason.to_owned(),
        };
        if self.executor.program.as_os_str().is_empty() {
            return Err(invalid("executor.program is empty"));
        }
        if self.executor.timeout_secs == 0 {
            return Err(invalid("executor.timeout_secs must be positive"));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be at least 1.0"));
        }
        if self.cache_dir == self.workspace_root {
            return Err(invalid("cache_dir and workspace_root must differ"));
        }
        Ok(())
    }

    /// Coordinator tuning derived from these settings.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            retry: self.retry.clone(),
            task_timeout: Duration::from_secs(self.executor.timeout_secs),
            finished_retention: self.finished_retention,
        }
    }

    /// Command line for the process executor.
    pub fn worker_command(&self) -> WorkerCommand {
        WorkerCommand {
            program: self.executor.program.clone(),
            args: self.executor.args.clone(),
        }
    }
}
