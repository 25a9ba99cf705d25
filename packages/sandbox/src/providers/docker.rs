// ABOUTME: Docker provider implementation for container-based sandboxes
// ABOUTME: Uses bollard for lifecycle and exec, and tar archives for moving files in and out

use super::{
    BackgroundCommand, EntryKind, ExecResult, Provider, ProviderError, Result, Sandbox,
    SandboxEntry, SandboxSpec,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::io::Read;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type ExecOutput = Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, BollardError>> + Send>>;

/// Interval between exec inspections while waiting for an exit code
const EXEC_REAP_INTERVAL: Duration = Duration::from_millis(50);
const EXEC_REAP_ATTEMPTS: usize = 20;

pub struct DockerProvider {
    client: Docker,
    image: String,
    label_prefix: String,
    /// Timeout for image pull operations (default: 10 minutes)
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Connect with Docker defaults and use `image` for every sandbox
    pub fn new(image: impl Into<String>) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self::with_client(client, image))
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker, image: impl Into<String>) -> Self {
        Self {
            client,
            image: image.into(),
            label_prefix: "coderun.sandbox".to_string(),
            pull_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    /// Container configuration for one sandbox
    fn to_bollard_config(&self, spec: &SandboxSpec) -> Config<String> {
        let mut labels = HashMap::new();
        labels.insert(format!("{}.managed", self.label_prefix), "true".to_string());
        if let Some(label) = &spec.label {
            labels.insert(format!("{}.run", self.label_prefix), label.clone());
        }

        let host_config = bollard::models::HostConfig {
            network_mode: Some(network_mode(spec.allow_network).to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            privileged: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(self.image.clone()),
            // Keep the container alive; all work happens through exec
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            labels: Some(labels),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(self.pull_timeout, async {
            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    ProviderError::ContainerError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = info.error {
                    return Err(ProviderError::ContainerError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    debug!("Pull status: {}", status);
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(result) => result,
            Err(_) => Err(ProviderError::ContainerError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }
}

fn network_mode(allow_network: bool) -> &'static str {
    if allow_network {
        "bridge"
    } else {
        "none"
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>> {
        if !self.image_exists(&self.image).await? {
            self.pull_image(&self.image).await?;
        }

        let name = format!("coderun-{}", uuid::Uuid::new_v4().simple());
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), self.to_bollard_config(spec))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        let sandbox = DockerSandbox {
            client: self.client.clone(),
            id: container.id,
        };

        if let Err(e) = self
            .client
            .start_container(&sandbox.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = sandbox.destroy().await;
            return Err(ProviderError::ContainerError(e.to_string()));
        }

        info!(
            "Created sandbox container {} ({}, network: {})",
            sandbox.id,
            name,
            network_mode(spec.allow_network)
        );
        Ok(Arc::new(sandbox))
    }
}

/// A running container used as a sandbox
pub struct DockerSandbox {
    client: Docker,
    id: String,
}

impl DockerSandbox {
    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.client.download_from_container(&self.id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(BollardError::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(ProviderError::NotFound(path.to_string())),
                Err(e) => return Err(ProviderError::ContainerError(e.to_string())),
            }
        }
        Ok(data)
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        let result = self.run(&format!("mkdir -p -- {}", shell_quote(path))).await?;
        if !result.success() {
            return Err(ProviderError::CommandError(format!(
                "mkdir {} exited with code {}",
                path, result.exit_code
            )));
        }
        Ok(())
    }

    /// Uploads next to the target and renames it into place, so a reader
    /// polling `path` never sees a half-extracted file
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let staged = staging_path(path);
        let archive = single_file_archive(&staged, content)?;

        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(&self.id, Some(options), archive.into())
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        let result = self
            .run(&format!("mv -f -- {} {}", shell_quote(&staged), shell_quote(path)))
            .await?;
        if !result.success() {
            return Err(ProviderError::CommandError(format!(
                "mv {} exited with code {}",
                staged, result.exit_code
            )));
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let data = self.download(path).await?;
        let mut archive = tar::Archive::new(&data[..]);

        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.header().entry_type().is_file() {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                return Ok(content);
            }
        }

        Err(ProviderError::NotFound(path.to_string()))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<SandboxEntry>> {
        let data = self.download(path).await?;
        let base = path.trim_end_matches('/');
        let mut archive = tar::Archive::new(&data[..]);
        let mut entries = Vec::new();

        for entry in archive.entries()? {
            let entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            // Archive paths start with the directory's own name
            let Some((_, child)) = name.trim_end_matches('/').split_once('/') else {
                continue;
            };
            if child.contains('/') {
                continue;
            }

            let entry_type = entry.header().entry_type();
            let kind = if entry_type.is_dir() {
                EntryKind::Dir
            } else if entry_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };

            entries.push(SandboxEntry {
                path: format!("{}/{}", base, child),
                kind,
                size: entry.header().size().ok(),
            });
        }

        Ok(entries)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let result = self.run(&format!("rm -f -- {}", shell_quote(path))).await?;
        if !result.success() {
            return Err(ProviderError::CommandError(format!(
                "rm {} exited with code {}",
                path, result.exit_code
            )));
        }
        Ok(())
    }

    async fn run(&self, command: &str) -> Result<ExecResult> {
        debug!("Executing command in container {}: {}", self.id, command);

        let (exec_id, output) = start_exec_with_id(&self.client, &self.id, command).await?;
        let (stdout, stderr) = drain_output(output).await;
        let exit_code = exec_exit_code(&self.client, &exec_id).await?;

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn spawn(&self, command: &str) -> Result<Arc<dyn BackgroundCommand>> {
        let pid_file = "/tmp/.coderun-bg.pid";
        let wrapped = format!("echo $$ > {}; exec {}", pid_file, command);
        let (exec_id, output) = start_exec_with_id(&self.client, &self.id, &wrapped).await?;

        debug!("Started background exec {} in {}", exec_id, self.id);
        Ok(Arc::new(DockerCommand {
            client: self.client.clone(),
            container_id: self.id.clone(),
            exec_id,
            output: Mutex::new(Some(output)),
            pid_file: pid_file.to_string(),
        }))
    }

    async fn destroy(&self) -> Result<()> {
        info!("Removing sandbox container {}", self.id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(&self.id, Some(options)).await {
            Ok(_) => Ok(()),
            // Container already removed is not an error
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }
}

/// Background exec tracked by the pid it wrote on start
pub struct DockerCommand {
    client: Docker,
    container_id: String,
    exec_id: String,
    output: Mutex<Option<ExecOutput>>,
    pid_file: String,
}

#[async_trait]
impl BackgroundCommand for DockerCommand {
    async fn wait(&self) -> Result<ExecResult> {
        let output = self.output.lock().await.take().ok_or_else(|| {
            ProviderError::CommandError(format!("exec {} already awaited", self.exec_id))
        })?;

        let (stdout, stderr) = drain_output(output).await;
        let exit_code = exec_exit_code(&self.client, &self.exec_id).await?;

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn kill(&self) -> Result<()> {
        warn!(
            "Killing background exec {} in {}",
            self.exec_id, self.container_id
        );

        let command = format!("kill -9 \"$(cat {})\" 2>/dev/null", self.pid_file);
        let (exec_id, output) = start_exec_with_id(&self.client, &self.container_id, &command).await?;
        drain_output(output).await;
        exec_exit_code(&self.client, &exec_id).await?;
        Ok(())
    }
}

async fn start_exec_with_id(
    client: &Docker,
    container_id: &str,
    command: &str,
) -> Result<(String, ExecOutput)> {
    let exec_config = CreateExecOptions {
        cmd: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    };

    let exec = client
        .create_exec(container_id, exec_config)
        .await
        .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

    match client
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| ProviderError::ContainerError(e.to_string()))?
    {
        StartExecResults::Attached { output, .. } => Ok((exec.id, output)),
        StartExecResults::Detached => Err(ProviderError::ContainerError(
            "Exec was detached unexpectedly".to_string(),
        )),
    }
}

async fn drain_output(mut output: ExecOutput) -> (Vec<u8>, Vec<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    while let Some(msg) = output.next().await {
        match msg {
            Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
            Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
            Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
            Ok(_) => {}
            Err(e) => {
                warn!("Error reading exec output: {}", e);
                break;
            }
        }
    }

    (stdout, stderr)
}

/// Exit code of a finished exec; the daemon may lag behind the end of the output stream
async fn exec_exit_code(client: &Docker, exec_id: &str) -> Result<i64> {
    for _ in 0..EXEC_REAP_ATTEMPTS {
        let inspect = client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        if inspect.running != Some(true) {
            if let Some(code) = inspect.exit_code {
                return Ok(code);
            }
        }
        tokio::time::sleep(EXEC_REAP_INTERVAL).await;
    }

    Err(ProviderError::CommandError(format!(
        "exec {} did not report an exit code",
        exec_id
    )))
}

/// Tar archive holding one file at its path relative to `/`
fn single_file_archive(path: &str, content: &[u8]) -> Result<Vec<u8>> {
    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        return Err(ProviderError::InvalidPath(path.to_string()));
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, relative, content)?;
    builder.into_inner().map_err(ProviderError::Io)
}

fn staging_path(path: &str) -> String {
    format!("{}.partial", path)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
