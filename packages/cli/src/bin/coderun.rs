use clap::{Parser, Subcommand};
use coderun_config::constants::RUST_LOG;
use colored::*;
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::check::CheckArgs;
use cli::run::RunArgs;

#[derive(Parser)]
#[command(name = "coderun")]
#[command(about = "Coderun - run Python in disposable sandboxes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script and stream its events as JSON lines
    Run(RunArgs),
    /// Check that the configured substrate can create sandboxes
    Check(CheckArgs),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Logs go to stderr, stdout carries the event stream
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(RUST_LOG).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => cli::run::handle_run(args).await,
        Commands::Check(args) => cli::check::handle_check(args).await,
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}
