// ABOUTME: `coderun check` validates settings and checks the configured substrate
// ABOUTME: Exits non-zero when sandboxes cannot be created

use super::{load_config, ProviderArg};
use anyhow::Result;
use clap::Args;
use coderun_cli::config::ProviderKind;
use coderun_sandbox::EngineSettings;
use colored::*;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Substrate to check instead of CODERUN_PROVIDER
    #[arg(long, value_enum)]
    provider: Option<ProviderArg>,
}

pub async fn handle_check(args: CheckArgs) -> Result<i32> {
    let settings = EngineSettings::from_env()?;
    let config = load_config(args.provider)?;

    println!("{}", "Coderun configuration".bold());
    println!("  provider:        {}", config.provider);
    if config.provider == ProviderKind::Docker {
        println!("  image:           {}", config.image);
    }
    println!("  timeout:         {}s", settings.timeout.as_secs());
    println!("  tick interval:   {}ms", settings.tick_interval.as_millis());
    println!("  rpc timeout:     {}s", settings.rpc_timeout.as_secs());
    println!("  python:          {}", settings.python);
    println!("  install command: {}", settings.install_command);
    match &settings.runs_root {
        Some(root) => println!("  runs root:       {}", root.display()),
        None => println!("  runs root:       {}", "(not persisted)".dimmed()),
    }

    let available = match config.build_provider() {
        Ok(provider) => provider.is_available().await.unwrap_or(false),
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            false
        }
    };

    if available {
        println!("{} {} substrate is available", "✓".green(), config.provider);
        Ok(0)
    } else {
        println!("{} {} substrate is not available", "✗".red(), config.provider);
        Ok(1)
    }
}
