// ABOUTME: Provider traits and implementations for sandbox execution substrates
// ABOUTME: Defines the file and command capability a sandbox exposes to the host

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod docker;
pub mod local;

pub use docker::DockerProvider;
pub use local::LocalProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Path not found in sandbox: {0}")]
    NotFound(String),

    #[error("Path escapes sandbox root: {0}")]
    InvalidPath(String),

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provider not available: {0}")]
    NotAvailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Parameters for provisioning one sandbox
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    /// Outbound network access
    pub allow_network: bool,
    /// Identifier used to label the sandbox, usually the run id
    pub label: Option<String>,
}

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Other,
}

/// One entry returned by [`Sandbox::list_dir`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEntry {
    /// Full path inside the sandbox
    pub path: String,
    pub kind: EntryKind,
    /// Size reported by the substrate, if any
    pub size: Option<u64>,
}

/// Execution result from running a command in a sandbox
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Non-empty lines of stdout followed by stderr
    pub fn output_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&self.stderr).lines())
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Last non-empty stderr line, used as a short error description
    pub fn error_summary(&self) -> Option<String> {
        String::from_utf8_lossy(&self.stderr)
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

/// A command running in the background inside a sandbox
#[async_trait]
pub trait BackgroundCommand: Send + Sync {
    /// Block until the command exits and return its exit code and output
    async fn wait(&self) -> Result<ExecResult>;

    /// Best-effort kill; a concurrent `wait` returns shortly afterwards
    async fn kill(&self) -> Result<()>;
}

/// One provisioned, isolated execution environment
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Identifier assigned by the substrate
    fn id(&self) -> &str;

    /// Prefix under which the sandbox filesystem lives, empty for containers
    fn root(&self) -> &str {
        ""
    }

    /// Create a directory and its parents
    async fn make_dir(&self, path: &str) -> Result<()>;

    /// Write a file, replacing any existing content
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Read the whole file
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Direct children of a directory
    async fn list_dir(&self, path: &str) -> Result<Vec<SandboxEntry>>;

    /// Delete a file; a missing file is not an error
    async fn remove(&self, path: &str) -> Result<()>;

    /// Run a shell command to completion
    async fn run(&self, command: &str) -> Result<ExecResult>;

    /// Start a shell command in the background
    async fn spawn(&self, command: &str) -> Result<Arc<dyn BackgroundCommand>>;

    /// Tear the sandbox down
    async fn destroy(&self) -> Result<()>;
}

/// Substrate able to provision sandboxes
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check if the provider is available and configured correctly
    async fn is_available(&self) -> Result<bool>;

    /// Provision a fresh sandbox
    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>>;
}
