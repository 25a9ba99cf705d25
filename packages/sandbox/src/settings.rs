// ABOUTME: Engine settings loaded from environment variables
// ABOUTME: Timing budgets, preview limits, in-sandbox commands and the durable runs root

use coderun_config::constants::{
    CODERUN_INSTALL_COMMAND, CODERUN_PREVIEW_CHARS, CODERUN_PREVIEW_MAX_BYTES, CODERUN_PYTHON,
    CODERUN_RPC_TIMEOUT_SECS, CODERUN_RUNS_ROOT, CODERUN_TICK_MILLIS, CODERUN_TIMEOUT_SECS,
};
use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Placeholder replaced by the manifest path in the install command template
pub const MANIFEST_PLACEHOLDER: &str = "{manifest}";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {source}")]
    InvalidNumber {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("{0} must be greater than 0")]
    Zero(&'static str),
    #[error("{name} must contain {placeholder}: {value}")]
    MissingPlaceholder {
        name: &'static str,
        placeholder: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Wall-clock budget of the running phase
    pub timeout: Duration,
    /// Sleep between supervisor ticks
    pub tick_interval: Duration,
    /// Default budget of one in-sandbox RPC call
    pub rpc_timeout: Duration,
    /// How long the waiter may take to report after the loop ends
    pub final_wait: Duration,
    /// Largest file that still gets a text preview
    pub preview_max_bytes: u64,
    /// Preview length in characters
    pub preview_chars: usize,
    /// Interpreter used to launch the runner
    pub python: String,
    /// Install command, `{manifest}` is replaced by the manifest path
    pub install_command: String,
    /// Root of durable run directories, persistence is skipped when unset
    pub runs_root: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            tick_interval: Duration::from_millis(200),
            rpc_timeout: Duration::from_secs(30),
            final_wait: Duration::from_secs(5),
            preview_max_bytes: 4096,
            preview_chars: 400,
            python: "python".to_string(),
            install_command: format!("pip install -r {}", MANIFEST_PLACEHOLDER),
            runs_root: None,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let timeout = match read_positive(CODERUN_TIMEOUT_SECS)? {
            Some(secs) => Duration::from_secs(secs),
            None => defaults.timeout,
        };

        let tick_interval = match read_positive(CODERUN_TICK_MILLIS)? {
            Some(millis) => Duration::from_millis(millis),
            None => defaults.tick_interval,
        };

        let rpc_timeout = match read_positive(CODERUN_RPC_TIMEOUT_SECS)? {
            Some(secs) => Duration::from_secs(secs),
            None => defaults.rpc_timeout,
        };

        let preview_max_bytes =
            read_positive(CODERUN_PREVIEW_MAX_BYTES)?.unwrap_or(defaults.preview_max_bytes);

        let preview_chars = read_positive(CODERUN_PREVIEW_CHARS)?
            .map(|chars| chars as usize)
            .unwrap_or(defaults.preview_chars);

        let python = env::var(CODERUN_PYTHON)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.python);

        let install_command = env::var(CODERUN_INSTALL_COMMAND)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.install_command);

        if !install_command.contains(MANIFEST_PLACEHOLDER) {
            return Err(ConfigError::MissingPlaceholder {
                name: CODERUN_INSTALL_COMMAND,
                placeholder: MANIFEST_PLACEHOLDER,
                value: install_command,
            });
        }

        let runs_root = env::var(CODERUN_RUNS_ROOT)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            timeout,
            tick_interval,
            rpc_timeout,
            final_wait: defaults.final_wait,
            preview_max_bytes,
            preview_chars,
            python,
            install_command,
            runs_root,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_runs_root(mut self, runs_root: impl Into<PathBuf>) -> Self {
        self.runs_root = Some(runs_root.into());
        self
    }

    /// Install command with the manifest path filled in
    pub fn install_command_for(&self, manifest_path: &str) -> String {
        self.install_command
            .replace(MANIFEST_PLACEHOLDER, manifest_path)
    }

    /// Command that launches the entry runner
    pub fn runner_command(&self, runner_path: &str) -> String {
        format!("{} {}", self.python, runner_path)
    }
}

fn read_positive(name: &'static str) -> Result<Option<u64>, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };

    let value = raw
        .trim()
        .parse::<u64>()
        .map_err(|source| ConfigError::InvalidNumber { name, source })?;

    if value == 0 {
        return Err(ConfigError::Zero(name));
    }

    Ok(Some(value))
}
