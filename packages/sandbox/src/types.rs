// ABOUTME: Core type definitions for sandbox runs
// ABOUTME: Defines run requests, terminal results, artifacts and persisted file records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Callback receiving newly observed log lines, in order.
pub type LogSink = Arc<dyn Fn(&[String]) + Send + Sync>;

/// A dataset file staged into the sandbox input directory before the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFile {
    /// File name inside the input directory
    pub name: String,
    /// Location of the file on the host
    pub local_path: PathBuf,
}

/// Immutable input to one execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Source of the user module; must define `run(params, ctx)`
    pub code: String,
    /// Parameters forwarded to the entry function
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Package names installed before the entry runner starts
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Outbound network access for the sandbox
    #[serde(default)]
    pub allow_network: bool,
    /// Caller-supplied run identifier, echoed in the result
    #[serde(default)]
    pub run_id: Option<String>,
    /// Caller-supplied code version label, echoed in the result
    #[serde(default)]
    pub code_version: Option<i64>,
    /// Datasets to stage into the input directory
    #[serde(default)]
    pub input_files: Vec<InputFile>,
}

impl RunRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_network(mut self, allow_network: bool) -> Self {
        self.allow_network = allow_network;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_code_version(mut self, code_version: i64) -> Self {
        self.code_version = Some(code_version);
        self
    }

    pub fn with_input_file(mut self, name: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        self.input_files.push(InputFile {
            name: name.into(),
            local_path: local_path.into(),
        });
        self
    }

    /// Dependency names with surrounding whitespace removed and blanks dropped
    pub fn requested_packages(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .map(|pkg| pkg.trim())
            .filter(|pkg| !pkg.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Metadata about a file found in the sandbox after the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactFile {
    /// Path as seen inside the sandbox
    pub path: String,
    pub size_bytes: u64,
    /// Leading characters of small UTF-8 files
    pub preview: Option<String>,
}

/// Terminal record of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxExecutionResult {
    pub ok: bool,
    pub sandbox_id: String,
    pub logs: Vec<String>,
    pub files: Vec<ArtifactFile>,
    pub error: Option<String>,
    pub run_id: Option<String>,
    pub code_version: Option<i64>,
}

/// An artifact after it was copied into the durable run directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedFile {
    pub sandbox_path: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
}

/// Everything the reconciler wrote for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRun {
    pub run_dir: PathBuf,
    pub files: Vec<PersistedFile>,
    pub logs_path: PathBuf,
    pub metadata_path: Option<PathBuf>,
}

/// Supervisor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Bundle, config and inputs written; stale log removed
    Seeded,
    /// Dependency install in progress
    Installing,
    /// Entry runner launched in the background
    Running,
    /// Runner exited with code 0
    Completed,
    /// Install failure or non-zero exit
    Failed,
    /// Wall-clock budget exceeded
    TimedOut,
    /// Caller cancelled the run
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::TimedOut | RunState::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Seeded => "seeded",
            RunState::Installing => "installing",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::TimedOut => "timed_out",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What [`crate::SandboxEngine::execute`] hands back
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: SandboxExecutionResult,
    /// Present when the engine has a runs root and the request carried a run id
    pub persisted: Option<PersistedRun>,
    pub state: RunState,
}
