// ABOUTME: Host side of the file-based RPC bridge between the sandbox and the host
// ABOUTME: Drains request files once per tick, dispatches to injected handlers and writes responses

use crate::layout::SandboxLayout;
use crate::providers::{EntryKind, ProviderError, Result, Sandbox};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handler for one host action. Handlers are pure functions of their payload.
pub type HostAction = dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync;

/// Injected mapping from action name to handler.
///
/// Built once and shared read-only between runs.
#[derive(Clone, Default)]
pub struct HostActions {
    handlers: HashMap<String, Arc<HostAction>>,
}

impl fmt::Debug for HostActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostActions")
            .field("actions", &self.names())
            .finish()
    }
}

impl HostActions {
    /// An empty registry. Every request is answered with `unsupported_action`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `ping` action
    pub fn with_defaults() -> Self {
        Self::new().register("ping", |payload| Ok(json!({"ok": true, "pong": payload})))
    }

    pub fn register<F>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(action.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `action`. Never fails: handler errors and panics
    /// become `{ok: false, error}` results.
    pub async fn dispatch(&self, action: &str, payload: Value) -> Value {
        let Some(handler) = self.handlers.get(action).cloned() else {
            return error_result(format!("unsupported_action:{}", action));
        };

        match tokio::task::spawn_blocking(move || handler(payload)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => error_result(e.to_string()),
            Err(e) if e.is_panic() => {
                warn!("Host action '{}' panicked", action);
                error_result(format!("host action '{}' panicked", action))
            }
            Err(e) => error_result(e.to_string()),
        }
    }
}

fn error_result(message: String) -> Value {
    json!({"ok": false, "error": message})
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

/// Request written by the sandbox as `<corrId>.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
    #[serde(rename = "corrId", alias = "corr_id", default)]
    pub corr_id: Option<String>,
    #[serde(default)]
    pub ts: Option<f64>,
}

/// Response written back under the same correlation id
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationResponse {
    pub corr_id: String,
    pub data: Value,
}

/// Host end of the bridge for one sandbox
pub struct RpcBridge {
    actions: Arc<HostActions>,
    layout: SandboxLayout,
}

impl RpcBridge {
    pub fn new(actions: Arc<HostActions>, layout: SandboxLayout) -> Self {
        Self { actions, layout }
    }

    /// Serve every pending request once.
    ///
    /// Each request file is deleted right after it is read, before dispatch,
    /// so a correlation id is never served twice.
    pub async fn drain(&self, sandbox: &dyn Sandbox) -> Vec<CorrelationResponse> {
        let request_dir = self.layout.request_dir();
        let entries = match sandbox.list_dir(&request_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Request directory not readable: {}", e);
                return Vec::new();
            }
        };

        let mut served = Vec::new();
        for entry in entries {
            if entry.kind != EntryKind::File || !entry.path.ends_with(".json") {
                continue;
            }

            let raw = sandbox.read_file(&entry.path).await;
            if let Err(e) = sandbox.remove(&entry.path).await {
                warn!("Failed to delete request {}: {}", entry.path, e);
            }
            let raw = match raw {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Failed to read request {}: {}", entry.path, e);
                    continue;
                }
            };

            let stem = file_stem(&entry.path);
            let response = match serde_json::from_slice::<CorrelationRequest>(&raw) {
                Ok(request) => {
                    let corr_id = request
                        .corr_id
                        .filter(|id| is_safe_id(id))
                        .or(stem)
                        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
                    debug!("Dispatching host action '{}' for {}", request.action, corr_id);
                    CorrelationResponse {
                        data: self.actions.dispatch(&request.action, request.payload).await,
                        corr_id,
                    }
                }
                Err(e) => {
                    let Some(corr_id) = stem else {
                        warn!("Dropping malformed request {}: {}", entry.path, e);
                        continue;
                    };
                    CorrelationResponse {
                        corr_id,
                        data: error_result(format!("invalid_request:{}", e)),
                    }
                }
            };

            if let Err(e) = self.respond(sandbox, &response).await {
                warn!("Failed to write response {}: {}", response.corr_id, e);
                continue;
            }
            served.push(response);
        }

        served
    }

    async fn respond(&self, sandbox: &dyn Sandbox, response: &CorrelationResponse) -> Result<()> {
        let path = format!("{}/{}.json", self.layout.response_dir(), response.corr_id);
        let body = serde_json::to_vec(&response.data)
            .map_err(|e| ProviderError::InternalError(e.to_string()))?;
        sandbox.write_file(&path, &body).await
    }
}

fn file_stem(path: &str) -> Option<String> {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| is_safe_id(s))
        .map(str::to_string)
}

/// Correlation ids become file names, so they must stay a single path component
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
