// ABOUTME: Sandbox execution engine running submitted code in ephemeral isolated environments
// ABOUTME: Seeds a bootstrap runtime, bridges RPC over files, streams logs and collects artifacts

pub mod bootstrap;
pub mod collector;
pub mod error;
pub mod events;
pub mod install;
pub mod layout;
pub mod logs;
pub mod persistence;
pub mod providers;
pub mod rpc;
pub mod settings;
pub mod supervisor;
pub mod types;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use error::{EngineError, Result};
pub use events::{RunEvent, RunHandle};
pub use layout::SandboxLayout;
pub use providers::{DockerProvider, LocalProvider, Provider, ProviderError, Sandbox, SandboxSpec};
pub use rpc::HostActions;
pub use settings::{ConfigError, EngineSettings};
pub use supervisor::{SandboxEngine, SandboxLease};
pub use types::{
    ArtifactFile, InputFile, LogSink, PersistedFile, PersistedRun, RunOutcome, RunRequest,
    RunState, SandboxExecutionResult,
};
