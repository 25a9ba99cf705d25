// ABOUTME: CLI configuration read from the environment
// ABOUTME: Chooses the execution substrate and builds the matching provider

use coderun_config::constants::{CODERUN_IMAGE, CODERUN_PROVIDER};
use coderun_sandbox::{DockerProvider, LocalProvider, Provider, ProviderError};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_IMAGE: &str = "python:3.11-slim";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown provider '{0}', expected 'docker' or 'local'")]
    UnknownProvider(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    #[default]
    Docker,
    Local,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(ProviderKind::Docker),
            "local" => Ok(ProviderKind::Local),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Docker => write!(f, "docker"),
            ProviderKind::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub provider: ProviderKind,
    /// Image for Docker sandboxes
    pub image: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let provider = match env::var(CODERUN_PROVIDER) {
            Ok(value) if !value.trim().is_empty() => value.parse()?,
            _ => ProviderKind::default(),
        };

        let image = env::var(CODERUN_IMAGE)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());

        Ok(Config { provider, image })
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    /// Provider for the configured substrate
    pub fn build_provider(&self) -> Result<Arc<dyn Provider>, ConfigError> {
        let provider: Arc<dyn Provider> = match self.provider {
            ProviderKind::Docker => Arc::new(DockerProvider::new(self.image.clone())?),
            ProviderKind::Local => Arc::new(LocalProvider::new()),
        };
        Ok(provider)
    }
}
