// ABOUTME: Local process provider backed by one temporary directory per sandbox
// ABOUTME: Development substrate: shell commands run on the host with the sandbox root as working directory

use super::{
    BackgroundCommand, EntryKind, ExecResult, Provider, ProviderError, Result, Sandbox,
    SandboxEntry, SandboxSpec,
};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Provisions sandboxes as temporary directories on the host.
///
/// There is no isolation beyond the directory boundary enforced on file
/// operations: commands run as the current user and keep host networking.
pub struct LocalProvider {
    base_dir: Option<PathBuf>,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self { base_dir: None }
    }

    /// Create sandbox directories under `base_dir` instead of the system temp dir
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn is_available(&self) -> Result<bool> {
        match &self.base_dir {
            Some(dir) => Ok(tokio::fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false)),
            None => Ok(true),
        }
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>> {
        if !spec.allow_network {
            warn!("Local provider cannot disable network access; the sandbox keeps host networking");
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("coderun-");
        let dir = match &self.base_dir {
            Some(base) => builder.tempdir_in(base)?,
            None => builder.tempdir()?,
        };

        let root = dir
            .path()
            .to_str()
            .ok_or_else(|| ProviderError::InvalidPath(dir.path().display().to_string()))?
            .to_string();
        let id = format!("local-{}", uuid::Uuid::new_v4().simple());

        info!("Created local sandbox {} at {}", id, root);
        Ok(Arc::new(LocalSandbox {
            id,
            root,
            dir: Mutex::new(Some(dir)),
        }))
    }
}

pub struct LocalSandbox {
    id: String,
    root: String,
    dir: Mutex<Option<TempDir>>,
}

impl LocalSandbox {
    /// Resolve a sandbox path, refusing anything outside the root
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let candidate = Path::new(path);
        let inside = candidate.starts_with(&self.root)
            && !candidate
                .components()
                .any(|c| matches!(c, Component::ParentDir));

        if !inside {
            return Err(ProviderError::InvalidPath(path.to_string()));
        }
        Ok(candidate.to_path_buf())
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

fn not_found(path: &str, err: std::io::Error) -> ProviderError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ProviderError::NotFound(path.to_string())
    } else {
        ProviderError::Io(err)
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn root(&self) -> &str {
        &self.root
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.resolve(path)?).await?;
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Readers polling for the file must never see it half written
        let mut staging = target.clone().into_os_string();
        staging.push(".partial");
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, &target).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.resolve(path)?)
            .await
            .map_err(|e| not_found(path, e))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<SandboxEntry>> {
        let dir = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| not_found(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };
            let size = match kind {
                EntryKind::File => entry.metadata().await.ok().map(|m| m.len()),
                _ => None,
            };

            entries.push(SandboxEntry {
                path: entry.path().to_string_lossy().into_owned(),
                kind,
                size,
            });
        }

        Ok(entries)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::Io(e)),
        }
    }

    async fn run(&self, command: &str) -> Result<ExecResult> {
        debug!("Executing command in {}: {}", self.id, command);

        let output = self
            .command(command)
            .output()
            .await
            .map_err(|e| ProviderError::CommandError(e.to_string()))?;

        Ok(ExecResult {
            exit_code: exit_code(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn spawn(&self, command: &str) -> Result<Arc<dyn BackgroundCommand>> {
        let child = self
            .command(&format!("exec {}", command))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProviderError::CommandError(e.to_string()))?;

        debug!("Started background command in {}: {}", self.id, command);
        Ok(Arc::new(LocalCommand {
            child: Mutex::new(Some(child)),
            kill_signal: Notify::new(),
        }))
    }

    async fn destroy(&self) -> Result<()> {
        let Some(dir) = self.dir.lock().await.take() else {
            return Ok(());
        };

        info!("Removing local sandbox {}", self.id);
        tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(|e| ProviderError::InternalError(e.to_string()))??;
        Ok(())
    }
}

pub struct LocalCommand {
    child: Mutex<Option<Child>>,
    kill_signal: Notify,
}

#[async_trait]
impl BackgroundCommand for LocalCommand {
    async fn wait(&self) -> Result<ExecResult> {
        let mut child = self
            .child
            .lock()
            .await
            .take()
            .ok_or_else(|| ProviderError::CommandError("command already awaited".to_string()))?;

        let stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take()));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = self.kill_signal.notified() => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill background command: {}", e);
                }
                child.wait().await?
            }
        };

        Ok(ExecResult {
            exit_code: exit_code(status),
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
        })
    }

    async fn kill(&self) -> Result<()> {
        // Stored as a permit when no wait is in progress yet
        self.kill_signal.notify_one();
        Ok(())
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut data = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut data).await {
            warn!("Failed to read command output: {}", e);
        }
    }
    data
}

fn exit_code(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return code as i64;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as i64;
        }
    }

    -1
}
