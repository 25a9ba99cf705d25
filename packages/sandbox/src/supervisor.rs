// ABOUTME: Execution supervisor driving one run from sandbox creation to the terminal result
// ABOUTME: Seeds the bundle, installs dependencies, polls RPC and logs under a wall-clock budget, then collects

use crate::bootstrap::{BundleBuilder, RunnerConfig, ERROR_MARKER};
use crate::collector::ArtifactCollector;
use crate::error::{EngineError, Result};
use crate::install::DependencyInstaller;
use crate::layout::SandboxLayout;
use crate::logs::LogTailer;
use crate::persistence::{PersistenceReconciler, RunMetadata};
use crate::providers::{
    BackgroundCommand, ExecResult, Provider, ProviderError, Sandbox, SandboxSpec,
};
use crate::rpc::{HostActions, RpcBridge};
use crate::settings::EngineSettings;
use crate::types::{LogSink, PersistedRun, RunOutcome, RunRequest, RunState, SandboxExecutionResult};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

pub const TIMEOUT_ERROR: &str = "Sandbox execution timed out";
pub const CANCELLED_ERROR: &str = "Sandbox execution cancelled";

/// Roughly thirty years, used when a configured budget does not fit in an `Instant`
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

/// Owns a sandbox for the duration of one run.
///
/// [`SandboxLease::release`] destroys it. If the lease is dropped without
/// being released (the run future was dropped or panicked), destruction is
/// spawned onto the current runtime instead.
pub struct SandboxLease {
    sandbox: Option<Arc<dyn Sandbox>>,
}

impl SandboxLease {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox: Some(sandbox),
        }
    }

    pub fn sandbox(&self) -> Option<&Arc<dyn Sandbox>> {
        self.sandbox.as_ref()
    }

    pub async fn release(mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            destroy(sandbox).await;
        }
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(destroy(sandbox));
            }
            Err(_) => error!(
                "Sandbox {} leaked: no runtime available to destroy it",
                sandbox.id()
            ),
        }
    }
}

async fn destroy(sandbox: Arc<dyn Sandbox>) {
    match sandbox.destroy().await {
        Ok(()) => debug!("Destroyed sandbox {}", sandbox.id()),
        Err(e) => warn!("Failed to destroy sandbox {}: {}", sandbox.id(), e),
    }
}

/// Runs code in fresh sandboxes.
///
/// Cheap to clone; runs started from clones share the provider and the
/// host action registry but nothing else.
#[derive(Clone)]
pub struct SandboxEngine {
    provider: Arc<dyn Provider>,
    actions: Arc<HostActions>,
    settings: EngineSettings,
}

impl SandboxEngine {
    pub fn new(provider: Arc<dyn Provider>, settings: EngineSettings) -> Self {
        Self {
            provider,
            actions: Arc::new(HostActions::with_defaults()),
            settings,
        }
    }

    pub fn with_actions(mut self, actions: HostActions) -> Self {
        self.actions = Arc::new(actions);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Execute one run to completion.
    ///
    /// Only provisioning failures are returned as `Err`. Every run that got a
    /// sandbox yields a result, including seeding failures and timeouts.
    pub async fn execute(&self, request: &RunRequest, sink: Option<LogSink>) -> Result<RunOutcome> {
        self.run(request, sink, None).await
    }

    /// Like [`SandboxEngine::execute`], stopping early once `cancel` turns `true`
    pub async fn execute_with_cancel(
        &self,
        request: &RunRequest,
        sink: Option<LogSink>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome> {
        self.run(request, sink, Some(cancel)).await
    }

    async fn run(
        &self,
        request: &RunRequest,
        sink: Option<LogSink>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunOutcome> {
        let spec = SandboxSpec {
            allow_network: request.allow_network,
            label: request.run_id.clone(),
        };
        let sandbox = self
            .provider
            .create(&spec)
            .await
            .map_err(EngineError::Provisioning)?;
        info!(
            "Created sandbox {} (network: {})",
            sandbox.id(),
            request.allow_network
        );

        let lease = SandboxLease::new(sandbox.clone());
        let mut run = Supervisor::new(self, sandbox, request, sink);
        let outcome = run.drive(cancel).await;
        lease.release().await;
        Ok(outcome)
    }
}

/// How the running phase ended, before the exit code is looked at
enum Stop {
    Exited,
    TimedOut,
    Cancelled,
}

/// State of one run
struct Supervisor<'a> {
    engine: &'a SandboxEngine,
    sandbox: Arc<dyn Sandbox>,
    request: &'a RunRequest,
    layout: SandboxLayout,
    sink: Option<LogSink>,
    tailer: LogTailer,
    /// Installer output, already sent to the sink
    install_lines: Vec<String>,
    /// Runner output captured by the waiter, not yet sent to the sink
    stream_lines: Vec<String>,
    state: RunState,
}

impl<'a> Supervisor<'a> {
    fn new(
        engine: &'a SandboxEngine,
        sandbox: Arc<dyn Sandbox>,
        request: &'a RunRequest,
        sink: Option<LogSink>,
    ) -> Self {
        let layout = SandboxLayout::rooted(sandbox.root());
        Self {
            tailer: LogTailer::new(layout.log_file()),
            engine,
            sandbox,
            request,
            layout,
            sink,
            install_lines: Vec::new(),
            stream_lines: Vec::new(),
            state: RunState::Seeded,
        }
    }

    fn settings(&self) -> &EngineSettings {
        &self.engine.settings
    }

    fn transition(&mut self, state: RunState) {
        info!("Sandbox {}: {} -> {}", self.sandbox.id(), self.state, state);
        self.state = state;
    }

    fn emit(&self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        if let Some(sink) = &self.sink {
            sink(lines);
        }
    }

    async fn tail(&mut self) {
        let fresh = self.tailer.poll(self.sandbox.as_ref()).await;
        self.emit(&fresh);
    }

    async fn drive(&mut self, cancel: Option<watch::Receiver<bool>>) -> RunOutcome {
        if let Err(e) = self.seed().await {
            let error = format!("Failed to seed sandbox: {}", e);
            warn!("{} ({})", error, self.sandbox.id());
            return self.finish(RunState::Failed, Some(error)).await;
        }
        self.stage_inputs().await;
        info!("Sandbox {} seeded", self.sandbox.id());

        let packages = self.request.requested_packages();
        if !packages.is_empty() {
            self.transition(RunState::Installing);
            let installed = DependencyInstaller::new(&self.layout, self.settings())
                .install(self.sandbox.as_ref(), &packages)
                .await;

            if let Some(outcome) = installed {
                self.emit(&outcome.lines);
                self.install_lines = outcome.lines;
                if let Some(error) = outcome.error {
                    warn!("Dependency install failed in {}: {}", self.sandbox.id(), error);
                    let fresh = self.tailer.finish(self.sandbox.as_ref()).await;
                    self.emit(&fresh);
                    return self.finish(RunState::Failed, Some(error)).await;
                }
            }
        }

        let command = self.settings().runner_command(&self.layout.runner_path());
        let handle = match self.sandbox.spawn(&command).await {
            Ok(handle) => handle,
            Err(e) => {
                let error = format!("Failed to launch sandbox process: {}", e);
                warn!("{}", error);
                return self.finish(RunState::Failed, Some(error)).await;
            }
        };
        self.transition(RunState::Running);

        let (stop, exit) = self.supervise(handle, cancel).await;

        if let Some(Ok(exec)) = &exit {
            self.stream_lines = exec.output_lines();
        }

        let (state, error) = match stop {
            Stop::TimedOut => (RunState::TimedOut, Some(TIMEOUT_ERROR.to_string())),
            Stop::Cancelled => (RunState::Cancelled, Some(CANCELLED_ERROR.to_string())),
            Stop::Exited => match exit {
                Some(Ok(exec)) if exec.success() => (RunState::Completed, None),
                Some(Ok(exec)) => (RunState::Failed, Some(self.exit_error(&exec))),
                Some(Err(e)) => (RunState::Failed, Some(format!("Sandbox process failed: {}", e))),
                None => (RunState::Failed, Some("Sandbox process result unavailable".to_string())),
            },
        };

        self.finish(state, error).await
    }

    /// Write directories, bundle, user script and config, and drop any stale log
    async fn seed(&self) -> std::result::Result<(), ProviderError> {
        let sandbox = self.sandbox.as_ref();

        for dir in self.layout.directories() {
            sandbox.make_dir(&dir).await?;
        }

        let bundle = BundleBuilder::new(&self.layout, self.settings().rpc_timeout).build();
        for file in bundle {
            sandbox.write_file(&file.path, file.content.as_bytes()).await?;
        }

        sandbox
            .write_file(&self.layout.user_script(), self.request.code.as_bytes())
            .await?;

        let config = RunnerConfig::new(self.layout.user_script(), self.request.params.clone())
            .to_json()
            .map_err(|e| ProviderError::InternalError(e.to_string()))?;
        sandbox
            .write_file(&self.layout.config_path(), config.as_bytes())
            .await?;

        sandbox.remove(&self.layout.log_file()).await?;
        Ok(())
    }

    /// Copy dataset files into the input directory, skipping unreadable ones
    async fn stage_inputs(&self) {
        for input in &self.request.input_files {
            let Some(name) = Path::new(&input.name).file_name().and_then(|n| n.to_str()) else {
                warn!("Skipping input with invalid name {:?}", input.name);
                continue;
            };

            let content = match tokio::fs::read(&input.local_path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Skipping input {}: {}", input.local_path.display(), e);
                    continue;
                }
            };

            let target = format!("{}/{}", self.layout.input_dir(), name);
            if let Err(e) = self.sandbox.write_file(&target, &content).await {
                warn!("Failed to stage input {}: {}", name, e);
            }
        }
    }

    /// Poll loop of the running phase.
    ///
    /// A waiter task blocks on the command while this loop services RPC and
    /// the log file every tick. RPC servicing is bounded by the deadline so a
    /// slow handler cannot hold off the timeout.
    async fn supervise(
        &mut self,
        handle: Arc<dyn BackgroundCommand>,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> (Stop, Option<std::result::Result<ExecResult, ProviderError>>) {
        let (done_tx, mut done_rx) = oneshot::channel();
        let waiter = handle.clone();
        tokio::spawn(async move {
            let _ = done_tx.send(waiter.wait().await);
        });

        let bridge = RpcBridge::new(self.engine.actions.clone(), self.layout.clone());
        let tick = self.settings().tick_interval;
        let deadline = deadline_after(self.settings().timeout);
        let mut exit = None;

        let stop = loop {
            if timeout_at(deadline, bridge.drain(self.sandbox.as_ref()))
                .await
                .is_err()
            {
                warn!("RPC servicing in {} ran into the deadline", self.sandbox.id());
            }
            self.tail().await;

            if Instant::now() >= deadline {
                break Stop::TimedOut;
            }
            if cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                break Stop::Cancelled;
            }

            let next = deadline_after(tick).min(deadline);
            let cancel_closed = tokio::select! {
                biased;
                result = &mut done_rx => {
                    exit = Some(result.unwrap_or_else(|_| {
                        Err(ProviderError::InternalError("waiter stopped".to_string()))
                    }));
                    break Stop::Exited;
                }
                _ = sleep_until(next) => false,
                changed = cancelled(&mut cancel) => changed.is_err(),
            };
            if cancel_closed {
                cancel = None;
            }
        };

        if !matches!(stop, Stop::Exited) {
            warn!(
                "Sandbox {} stopping early: {}",
                self.sandbox.id(),
                if matches!(stop, Stop::TimedOut) { "timed out" } else { "cancelled" }
            );
            if let Err(e) = handle.kill().await {
                warn!("Failed to kill sandbox process: {}", e);
            }
            match timeout(self.settings().final_wait, &mut done_rx).await {
                Ok(Ok(result)) => exit = Some(result),
                Ok(Err(_)) => {}
                Err(_) => warn!("Sandbox process did not report after kill"),
            }
        }

        // Final drain so nothing written before the end is lost
        let _ = timeout(self.settings().final_wait, bridge.drain(self.sandbox.as_ref())).await;
        let fresh = self.tailer.finish(self.sandbox.as_ref()).await;
        self.emit(&fresh);

        (stop, exit)
    }

    fn exit_error(&self, exec: &ExecResult) -> String {
        let base = format!("Sandbox process exited with code {}", exec.exit_code);
        match traceback_summary(self.tailer.lines()) {
            Some(summary) => format!("{}: {}", base, summary),
            None => base,
        }
    }

    /// Merge stream output into the logs, collect, persist and build the result
    async fn finish(&mut self, state: RunState, error: Option<String>) -> RunOutcome {
        self.transition(state);

        let mut logs = self.tailer.lines().to_vec();
        let mut seen: HashSet<String> = logs.iter().cloned().collect();
        for line in std::mem::take(&mut self.install_lines) {
            if seen.insert(line.clone()) {
                logs.push(line);
            }
        }
        let merged: Vec<String> = std::mem::take(&mut self.stream_lines)
            .into_iter()
            .filter(|line| seen.insert(line.clone()))
            .collect();
        self.emit(&merged);
        logs.extend(merged);

        let layout = &self.layout;
        let files = ArtifactCollector::new(layout, self.settings())
            .collect(self.sandbox.as_ref())
            .await;

        let result = SandboxExecutionResult {
            ok: error.is_none(),
            sandbox_id: self.sandbox.id().to_string(),
            logs,
            files,
            error,
            run_id: self.request.run_id.clone(),
            code_version: self.request.code_version,
        };

        let persisted = self.persist(&result).await;
        info!(
            "Sandbox {} finished: ok={} files={} logs={}",
            result.sandbox_id,
            result.ok,
            result.files.len(),
            result.logs.len()
        );

        RunOutcome {
            result,
            persisted,
            state,
        }
    }

    async fn persist(&self, result: &SandboxExecutionResult) -> Option<PersistedRun> {
        let root = self.settings().runs_root.as_ref()?;
        let run_id = self.request.run_id.as_deref()?;
        let Some(reconciler) = PersistenceReconciler::for_run(root, run_id) else {
            warn!("Not persisting run {:?}: run id is not a plain directory name", run_id);
            return None;
        };

        let mut persisted = match reconciler
            .persist(self.sandbox.as_ref(), &self.layout, &result.files, &result.logs)
            .await
        {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!("Failed to persist run {}: {}", run_id, e);
                return None;
            }
        };

        match reconciler
            .write_metadata(&RunMetadata::new(self.request, result))
            .await
        {
            Ok(path) => persisted.metadata_path = Some(path),
            Err(e) => warn!("Failed to write metadata for run {}: {}", run_id, e),
        }

        Some(persisted)
    }
}

/// `now + budget`, saturating at a far-future instant instead of overflowing
fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
}

async fn cancelled(
    cancel: &mut Option<watch::Receiver<bool>>,
) -> std::result::Result<(), watch::error::RecvError> {
    match cancel {
        Some(rx) => rx.changed().await,
        None => std::future::pending().await,
    }
}

/// Final line of the traceback the runner logged after `[runner] ERROR:`
pub fn traceback_summary(lines: &[String]) -> Option<String> {
    let start = lines.iter().rposition(|line| line.contains(ERROR_MARKER))?;
    lines[start + 1..]
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
}
