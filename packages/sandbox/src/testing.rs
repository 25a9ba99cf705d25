// ABOUTME: In-memory sandbox substrate for tests, no Docker or Python required
// ABOUTME: Background commands are scripted async closures that stand in for the in-sandbox runner

use crate::layout::SandboxLayout;
use crate::providers::{
    BackgroundCommand, EntryKind, ExecResult, Provider, ProviderError, Result, Sandbox,
    SandboxEntry, SandboxSpec,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

pub type RunnerScript = Arc<dyn Fn(Arc<MemorySandbox>) -> BoxFuture<'static, ExecResult> + Send + Sync>;
/// Result of a foreground command, given the sandbox it runs in
pub type RunHook = Arc<dyn Fn(&MemorySandbox, &str) -> ExecResult + Send + Sync>;

/// Outcome of a scripted entry function: its return value or the exception it raised
pub type EntryResult = std::result::Result<String, String>;

pub fn returned(value: impl std::fmt::Display) -> EntryResult {
    Ok(value.to_string())
}

pub fn raised(exception: impl Into<String>) -> EntryResult {
    Err(exception.into())
}

/// Wrap an async closure as a runner script
pub fn script<F, Fut>(body: F) -> RunnerScript
where
    F: Fn(Arc<MemorySandbox>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecResult> + Send + 'static,
{
    Arc::new(move |sandbox| Box::pin(body(sandbox)))
}

/// Runner script following the bootstrap runner's log conventions.
///
/// `body` gets the sandbox and the params from the config file. `Err` plays
/// the role of an uncaught exception and carries its final traceback line.
pub fn entry<F, Fut>(body: F) -> RunnerScript
where
    F: Fn(Arc<MemorySandbox>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EntryResult> + Send + 'static,
{
    let body = Arc::new(body);
    script(move |sandbox| {
        let body = body.clone();
        async move {
            let layout = sandbox.layout();
            let config = sandbox
                .get_json(&layout.config_path())
                .unwrap_or_else(|| json!({}));
            let entrypoint = config["entrypoint"].as_str().unwrap_or_default().to_string();
            let params = config["params"].as_object().cloned().unwrap_or_default();

            sandbox.log(&format!("[runner] launching {}", entrypoint));
            match (*body)(sandbox.clone(), params).await {
                Ok(result) => {
                    sandbox.log(&format!("[runner] run completed result={}", result));
                    ExecResult::default()
                }
                Err(exception) => {
                    let traceback = format!(
                        "Traceback (most recent call last):\n  File \"{}\", line 1, in run\n{}",
                        entrypoint, exception
                    );
                    sandbox.log(&format!("[runner] ERROR:\n{}", traceback));
                    ExecResult {
                        exit_code: 1,
                        stdout: Vec::new(),
                        stderr: format!("{}\n", traceback).into_bytes(),
                    }
                }
            }
        }
    })
}

/// Sandbox whose filesystem is a map from path to bytes
pub struct MemorySandbox {
    id: String,
    root: String,
    me: Weak<MemorySandbox>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<BTreeSet<String>>,
    unreadable: Mutex<BTreeSet<String>>,
    unwritable: Mutex<BTreeSet<String>>,
    commands: Mutex<Vec<String>>,
    run_hook: Mutex<Option<RunHook>>,
    runner: Mutex<Option<RunnerScript>>,
    destroyed: AtomicUsize,
}

impl MemorySandbox {
    pub fn new(id: impl Into<String>, root: &str) -> Arc<Self> {
        let id = id.into();
        let root = root.trim_end_matches('/').to_string();
        Arc::new_cyclic(|me| Self {
            id,
            root,
            me: me.clone(),
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(BTreeSet::new()),
            unreadable: Mutex::new(BTreeSet::new()),
            unwritable: Mutex::new(BTreeSet::new()),
            commands: Mutex::new(Vec::new()),
            run_hook: Mutex::new(None),
            runner: Mutex::new(None),
            destroyed: AtomicUsize::new(0),
        })
    }

    /// Sandbox at `/` with the layout directories already present
    pub fn seeded() -> Arc<Self> {
        Self::rooted("")
    }

    /// Sandbox under `root` with the layout directories already present
    pub fn rooted(root: &str) -> Arc<Self> {
        let sandbox = Self::new(format!("memory-{}", uuid::Uuid::new_v4().simple()), root);
        for dir in sandbox.layout().directories() {
            sandbox.add_dir(&dir);
        }
        sandbox
    }

    pub fn layout(&self) -> SandboxLayout {
        SandboxLayout::rooted(&self.root)
    }

    fn add_dir(&self, path: &str) {
        let mut dirs = self.dirs.lock().unwrap();
        let mut current = path.trim_end_matches('/');
        while !current.is_empty() {
            dirs.insert(current.to_string());
            current = match current.rfind('/') {
                Some(idx) => &current[..idx],
                None => "",
            };
        }
    }

    fn add_parents(&self, path: &str) {
        if let Some(idx) = path.rfind('/') {
            self.add_dir(&path[..idx]);
        }
    }

    pub fn put(&self, path: &str, value: Value) {
        self.put_raw(path, &serde_json::to_vec(&value).unwrap());
    }

    pub fn put_raw(&self, path: &str, content: &[u8]) {
        self.add_parents(path);
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }

    pub fn append(&self, path: &str, text: &str) {
        self.append_bytes(path, text.as_bytes());
    }

    pub fn append_bytes(&self, path: &str, bytes: &[u8]) {
        self.add_parents(path);
        self.files
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(bytes);
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn get_json(&self, path: &str) -> Option<Value> {
        self.get(path)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub fn take(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().remove(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    /// Make every read of `path` fail
    pub fn fail_reads(&self, path: &str) {
        self.unreadable.lock().unwrap().insert(path.to_string());
    }

    /// Make every write to `path` fail
    pub fn fail_writes(&self, path: &str) {
        self.unwritable.lock().unwrap().insert(path.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Result of foreground commands
    pub fn on_run<F>(&self, hook: F)
    where
        F: Fn(&MemorySandbox, &str) -> ExecResult + Send + Sync + 'static,
    {
        *self.run_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn set_runner(&self, runner: RunnerScript) {
        *self.runner.lock().unwrap() = Some(runner);
    }

    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Append one line to the shared log file, as `ctx.log` does
    pub fn log(&self, line: &str) {
        self.append(&self.layout().log_file(), &format!("{}\n", line));
    }

    /// Write `<name>.json` into the artifact directory, as `ctx.write_outputs` does
    pub fn write_output(&self, name: &str, value: Value) {
        let path = format!("{}/{}.json", self.layout().artifact_dir(), name);
        self.put_raw(&path, &serde_json::to_vec_pretty(&value).unwrap());
    }

    /// Sandbox side of the RPC bridge, as `ctx.rpc_call` does
    pub async fn rpc_call(&self, action: &str, payload: Value, timeout: Duration) -> Option<Value> {
        let layout = self.layout();
        let corr_id = uuid::Uuid::new_v4().to_string();
        self.put(
            &format!("{}/{}.json", layout.request_dir(), corr_id),
            json!({"action": action, "payload": payload, "corrId": corr_id, "ts": 0.0}),
        );

        let response_path = format!("{}/{}.json", layout.response_dir(), corr_id);
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(bytes) = self.take(&response_path) {
                return serde_json::from_slice(&bytes).ok();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn root(&self) -> &str {
        &self.root
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        self.add_dir(path);
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        if self.unwritable.lock().unwrap().contains(path) {
            return Err(ProviderError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                path.to_string(),
            )));
        }
        self.put_raw(path, content);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        if self.unreadable.lock().unwrap().contains(path) {
            return Err(ProviderError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                path.to_string(),
            )));
        }
        self.get(path)
            .ok_or_else(|| ProviderError::NotFound(path.to_string()))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<SandboxEntry>> {
        let dir = path.trim_end_matches('/');
        let prefix = format!("{}/", dir);
        let mut children: BTreeMap<String, SandboxEntry> = BTreeMap::new();

        for (file, content) in self.files.lock().unwrap().iter() {
            let Some(rest) = file.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                None => {
                    children.insert(
                        file.clone(),
                        SandboxEntry {
                            path: file.clone(),
                            kind: EntryKind::File,
                            size: Some(content.len() as u64),
                        },
                    );
                }
                Some((sub, _)) => {
                    let sub_path = format!("{}{}", prefix, sub);
                    children.insert(
                        sub_path.clone(),
                        SandboxEntry {
                            path: sub_path,
                            kind: EntryKind::Dir,
                            size: None,
                        },
                    );
                }
            }
        }

        let dirs = self.dirs.lock().unwrap();
        for sub_dir in dirs.iter() {
            if let Some(rest) = sub_dir.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    children.entry(sub_dir.clone()).or_insert(SandboxEntry {
                        path: sub_dir.clone(),
                        kind: EntryKind::Dir,
                        size: None,
                    });
                }
            }
        }

        if children.is_empty() && !dirs.contains(dir) {
            return Err(ProviderError::NotFound(path.to_string()));
        }
        Ok(children.into_values().collect())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn run(&self, command: &str) -> Result<ExecResult> {
        self.commands.lock().unwrap().push(command.to_string());
        let hook = self.run_hook.lock().unwrap().clone();
        Ok(hook.map(|hook| hook(self, command)).unwrap_or_default())
    }

    async fn spawn(&self, command: &str) -> Result<Arc<dyn BackgroundCommand>> {
        self.commands.lock().unwrap().push(command.to_string());
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| ProviderError::InternalError("sandbox dropped".to_string()))?;

        let runner = self.runner.lock().unwrap().clone();
        let handle: JoinHandle<ExecResult> = match runner {
            Some(runner) => tokio::spawn(runner(me)),
            None => tokio::spawn(async { ExecResult::default() }),
        };

        Ok(Arc::new(MemoryCommand {
            abort: handle.abort_handle(),
            handle: tokio::sync::Mutex::new(Some(handle)),
        }))
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryCommand {
    handle: tokio::sync::Mutex<Option<JoinHandle<ExecResult>>>,
    abort: AbortHandle,
}

#[async_trait]
impl BackgroundCommand for MemoryCommand {
    async fn wait(&self) -> Result<ExecResult> {
        let handle = self
            .handle
            .lock()
            .await
            .take()
            .ok_or_else(|| ProviderError::CommandError("command already awaited".to_string()))?;

        match handle.await {
            Ok(result) => Ok(result),
            Err(e) if e.is_cancelled() => Ok(ExecResult {
                exit_code: 137,
                stdout: Vec::new(),
                stderr: Vec::new(),
            }),
            Err(e) => Err(ProviderError::CommandError(e.to_string())),
        }
    }

    async fn kill(&self) -> Result<()> {
        self.abort.abort();
        Ok(())
    }
}

/// Provider handing out [`MemorySandbox`]es
#[derive(Default)]
pub struct MemoryProvider {
    runner: Option<RunnerScript>,
    run_hook: Option<RunHook>,
    unwritable: Vec<String>,
    unavailable: bool,
    created: Mutex<Vec<Arc<MemorySandbox>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner(mut self, runner: RunnerScript) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Result of every foreground command, in practice the install command
    pub fn with_run_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MemorySandbox, &str) -> ExecResult + Send + Sync + 'static,
    {
        self.run_hook = Some(Arc::new(hook));
        self
    }

    /// Sandboxes refuse writes to `path`
    pub fn with_failing_write(mut self, path: impl Into<String>) -> Self {
        self.unwritable.push(path.into());
        self
    }

    /// Provider whose `create` always fails
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn sandboxes(&self) -> Vec<Arc<MemorySandbox>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<MemorySandbox> {
        self.sandboxes().pop().expect("no sandbox created")
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn is_available(&self) -> Result<bool> {
        Ok(!self.unavailable)
    }

    async fn create(&self, _spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>> {
        if self.unavailable {
            return Err(ProviderError::NotAvailable("memory provider disabled".to_string()));
        }

        let sandbox = MemorySandbox::new(format!("memory-{}", uuid::Uuid::new_v4().simple()), "");
        if let Some(runner) = &self.runner {
            sandbox.set_runner(runner.clone());
        }
        if let Some(hook) = &self.run_hook {
            *sandbox.run_hook.lock().unwrap() = Some(hook.clone());
        }
        for path in &self.unwritable {
            sandbox.fail_writes(path);
        }

        self.created.lock().unwrap().push(sandbox.clone());
        Ok(sandbox)
    }
}
