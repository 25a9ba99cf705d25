// ABOUTME: Copies collected artifacts and final logs out of the sandbox into a durable run directory
// ABOUTME: Also writes run.json metadata for the run-history store

use crate::error::Result;
use crate::layout::SandboxLayout;
use crate::providers::Sandbox;
use crate::types::{ArtifactFile, PersistedFile, PersistedRun, RunRequest, SandboxExecutionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

pub const LOGS_FILE: &str = "logs.txt";
pub const METADATA_FILE: &str = "run.json";

/// Record written next to the artifacts of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub run_id: Option<String>,
    pub code_version: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub code: String,
    pub params: Map<String, Value>,
    pub dependencies: Vec<String>,
    pub allow_network: bool,
    pub result: SandboxExecutionResult,
}

impl RunMetadata {
    pub fn new(request: &RunRequest, result: &SandboxExecutionResult) -> Self {
        Self {
            run_id: request.run_id.clone(),
            code_version: request.code_version,
            created_at: Utc::now(),
            code: request.code.clone(),
            params: request.params.clone(),
            dependencies: request.dependencies.clone(),
            allow_network: request.allow_network,
            result: result.clone(),
        }
    }
}

/// Writes one run directory
pub struct PersistenceReconciler {
    run_dir: PathBuf,
}

impl PersistenceReconciler {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    /// Reconciler for `<runs_root>/<run_id>`.
    ///
    /// `None` unless `run_id` is exactly one plain path component, so a run
    /// directory can never land outside `runs_root`.
    pub fn for_run(runs_root: &Path, run_id: &str) -> Option<Self> {
        let mut components = Path::new(run_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if part == run_id => {
                Some(Self::new(runs_root.join(part)))
            }
            _ => None,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Local path mirroring a sandbox-relative path, or `None` if it would leave the run directory
    pub fn local_path(&self, sandbox_path: &str) -> Option<PathBuf> {
        let mut target = self.run_dir.clone();
        let mut pushed = false;
        for component in Path::new(sandbox_path).components() {
            match component {
                Component::Normal(part) => {
                    target.push(part);
                    pushed = true;
                }
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => return None,
            }
        }
        pushed.then_some(target)
    }

    /// Copy every artifact and write the logs file.
    ///
    /// A file that cannot be read or written is left out; only failing to
    /// create the run directory or the logs file is an error.
    pub async fn persist(
        &self,
        sandbox: &dyn Sandbox,
        layout: &SandboxLayout,
        files: &[ArtifactFile],
        logs: &[String],
    ) -> Result<PersistedRun> {
        tokio::fs::create_dir_all(&self.run_dir).await?;

        let mut persisted = Vec::with_capacity(files.len());
        for file in files {
            match self.copy(sandbox, layout, file).await {
                Some(record) => persisted.push(record),
                None => debug!("Artifact {} not persisted", file.path),
            }
        }

        let logs_path = self.run_dir.join(LOGS_FILE);
        tokio::fs::write(&logs_path, logs.join("\n")).await?;

        Ok(PersistedRun {
            run_dir: self.run_dir.clone(),
            files: persisted,
            logs_path,
            metadata_path: None,
        })
    }

    async fn copy(
        &self,
        sandbox: &dyn Sandbox,
        layout: &SandboxLayout,
        file: &ArtifactFile,
    ) -> Option<PersistedFile> {
        let Some(target) = self.local_path(&file.path) else {
            warn!("Refusing to persist {} outside the run directory", file.path);
            return None;
        };

        let data = match sandbox.read_file(&layout.absolute(&file.path)).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to read {} from sandbox: {}", file.path, e);
                return None;
            }
        };

        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Failed to create {}: {}", parent.display(), e);
                return None;
            }
        }

        if let Err(e) = tokio::fs::write(&target, &data).await {
            warn!("Failed to write {}: {}", target.display(), e);
            return None;
        }

        Some(PersistedFile {
            sandbox_path: file.path.clone(),
            local_path: target,
            size_bytes: file.size_bytes,
        })
    }

    pub async fn write_metadata(&self, metadata: &RunMetadata) -> Result<PathBuf> {
        let path = self.run_dir.join(METADATA_FILE);
        let body = serde_json::to_vec_pretty(metadata)?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}
