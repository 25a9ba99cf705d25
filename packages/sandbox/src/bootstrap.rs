// ABOUTME: Bootstrap bundle builder producing the support programs seeded into every sandbox
// ABOUTME: Pure text generation from the Python templates and the sandbox path layout

use crate::layout::SandboxLayout;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

const RUNNER_TEMPLATE: &str = include_str!("../bootstrap/runner.py");
const SDK_INIT_TEMPLATE: &str = include_str!("../bootstrap/sdk/__init__.py");
const SDK_RPC_TEMPLATE: &str = include_str!("../bootstrap/sdk/rpc.py");
const SDK_IO_TEMPLATE: &str = include_str!("../bootstrap/sdk/io.py");
const SDK_LOG_TEMPLATE: &str = include_str!("../bootstrap/sdk/log.py");

/// Log line prefix written by the runner right before user code is loaded
pub const LAUNCH_MARKER: &str = "[runner] launching";

/// Log line prefix written by the runner when the entry function raised
pub const ERROR_MARKER: &str = "[runner] ERROR:";

/// One file of the bundle, addressed by its path inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub path: String,
    pub content: String,
}

/// Contents of the config file read by the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub entrypoint: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl RunnerConfig {
    pub fn new(entrypoint: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            params,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Builds the runner and SDK sources for one layout.
pub struct BundleBuilder<'a> {
    layout: &'a SandboxLayout,
    rpc_timeout: Duration,
}

impl<'a> BundleBuilder<'a> {
    pub fn new(layout: &'a SandboxLayout, rpc_timeout: Duration) -> Self {
        Self {
            layout,
            rpc_timeout,
        }
    }

    fn substitutions(&self) -> Vec<(&'static str, String)> {
        vec![
            ("CONF_PATH", self.layout.config_path()),
            ("LOG_FILE", self.layout.log_file()),
            ("IO_DIR", self.layout.io_dir()),
            ("INPUT_DIR", self.layout.input_dir()),
            ("ARTIFACT_DIR", self.layout.artifact_dir()),
            ("REQUEST_DIR", self.layout.request_dir()),
            ("RESPONSE_DIR", self.layout.response_dir()),
            ("RPC_TIMEOUT", format!("{:.1}", self.rpc_timeout.as_secs_f64())),
        ]
    }

    /// All bundle files in the order they are written
    pub fn build(&self) -> Vec<BundleFile> {
        let values = self.substitutions();
        let sdk_dir = self.layout.sdk_dir();

        [
            (self.layout.runner_path(), RUNNER_TEMPLATE),
            (format!("{}/__init__.py", sdk_dir), SDK_INIT_TEMPLATE),
            (format!("{}/rpc.py", sdk_dir), SDK_RPC_TEMPLATE),
            (format!("{}/io.py", sdk_dir), SDK_IO_TEMPLATE),
            (format!("{}/log.py", sdk_dir), SDK_LOG_TEMPLATE),
        ]
        .into_iter()
        .map(|(path, template)| BundleFile {
            path,
            content: render(template, &values),
        })
        .collect()
    }
}

/// Replace every `${NAME}` placeholder with its value
fn render(template: &str, values: &[(&str, String)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |text, (name, value)| {
            text.replace(&format!("${{{}}}", name), value)
        })
}
