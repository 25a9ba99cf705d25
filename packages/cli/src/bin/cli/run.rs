// ABOUTME: `coderun run` executes one script in a fresh sandbox
// ABOUTME: Events are printed to stdout as JSON lines, Ctrl-C cancels the run

use super::{load_config, ProviderArg};
use anyhow::{bail, Result};
use clap::Args;
use coderun_cli::request::RunOptions;
use coderun_sandbox::{EngineSettings, RunEvent, SandboxEngine};
use colored::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Python file defining `run(params, ctx)`
    script: PathBuf,

    /// Parameters as a JSON object
    #[arg(long = "params", value_name = "JSON")]
    params_json: Option<String>,

    /// Single parameter, the value is parsed as JSON when possible
    #[arg(short, long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Package to install before the run
    #[arg(short, long = "dep", value_name = "PACKAGE")]
    dependencies: Vec<String>,

    /// Dataset file to stage into the input directory
    #[arg(short, long = "input", value_name = "NAME=PATH")]
    inputs: Vec<String>,

    /// Allow outbound network access
    #[arg(long)]
    network: bool,

    /// Run identifier (default: random UUID)
    #[arg(long)]
    run_id: Option<String>,

    #[arg(long)]
    code_version: Option<i64>,

    /// Override the running-phase budget in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Directory receiving durable run directories
    #[arg(long, value_name = "DIR")]
    runs_root: Option<PathBuf>,

    /// Substrate to use instead of CODERUN_PROVIDER
    #[arg(long, value_enum)]
    provider: Option<ProviderArg>,
}

pub async fn handle_run(args: RunArgs) -> Result<i32> {
    let config = load_config(args.provider)?;
    let provider = config.build_provider()?;
    if !provider.is_available().await? {
        bail!("The {} substrate is not available", config.provider);
    }

    let mut settings = EngineSettings::from_env()?;
    if let Some(secs) = args.timeout.filter(|secs| *secs > 0) {
        settings = settings.with_timeout(Duration::from_secs(secs));
    }
    if let Some(root) = args.runs_root {
        settings = settings.with_runs_root(root);
    }

    let request = RunOptions {
        script: args.script,
        params_json: args.params_json,
        params: args.params,
        dependencies: args.dependencies,
        inputs: args.inputs,
        network: args.network,
        run_id: args.run_id,
        code_version: args.code_version,
    }
    .into_request()?;

    info!(
        "Starting run {} on the {} substrate",
        request.run_id.as_deref().unwrap_or_default(),
        config.provider
    );

    let engine = SandboxEngine::new(provider, settings);
    let mut handle = engine.spawn_run(request);
    let mut exit_code = 1;
    let mut cancelled = false;

    loop {
        tokio::select! {
            event = handle.next_event() => {
                let Some(event) = event else {
                    break;
                };
                println!("{}", serde_json::to_string(&event)?);
                match &event {
                    RunEvent::Result { data } => {
                        exit_code = if data.ok { 0 } else { 1 };
                        report(data.ok, data.error.as_deref(), data.files.len());
                    }
                    RunEvent::Error { detail } => report(false, Some(detail), 0),
                    RunEvent::Log { .. } => {}
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                warn!("Interrupt received, cancelling run");
                handle.cancel();
                cancelled = true;
            }
        }
    }

    handle.join().await?;
    Ok(exit_code)
}

fn report(ok: bool, error: Option<&str>, files: usize) {
    if ok {
        eprintln!("{} {} file(s) collected", "✓ Run succeeded:".green().bold(), files);
    } else {
        eprintln!(
            "{} {}",
            "✗ Run failed:".red().bold(),
            error.unwrap_or("unknown error")
        );
    }
}
