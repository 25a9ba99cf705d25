pub mod check;
pub mod run;

use clap::ValueEnum;
use coderun_cli::config::{Config, ProviderKind};

/// Substrate override for a single invocation
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ProviderArg {
    Docker,
    Local,
}

impl From<ProviderArg> for ProviderKind {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Docker => ProviderKind::Docker,
            ProviderArg::Local => ProviderKind::Local,
        }
    }
}

/// Environment config with the command-line override applied
pub fn load_config(provider: Option<ProviderArg>) -> anyhow::Result<Config> {
    let config = Config::from_env()?;
    Ok(match provider {
        Some(provider) => config.with_provider(provider.into()),
        None => config,
    })
}
