// ABOUTME: Fixed in-sandbox path layout shared by the bootstrap bundle and the host side
// ABOUTME: Every path can be rooted under a prefix for substrates without their own filesystem

/// Directory names and file names relative to the sandbox root.
const APP_DIR: &str = "/app";
const SDK_DIR: &str = "/app/sdk";
const RUNNER_PATH: &str = "/app/runner.py";
const IO_DIR: &str = "/io";
const REQUEST_DIR: &str = "/io/requests";
const RESPONSE_DIR: &str = "/io/responses";
const LOG_FILE: &str = "/io/host.log";
const CONFIG_PATH: &str = "/io/config.json";
const ARTIFACT_DIR: &str = "/io/artifacts";
const INPUT_DIR: &str = "/io/inputs";
const MANIFEST_PATH: &str = "/io/requirements.txt";
const WORKSPACE_DIR: &str = "/workspace/user";
const USER_SCRIPT: &str = "/workspace/user/user_script.py";

/// Path layout of one sandbox.
///
/// Containers see the layout at `/`. The local substrate has no private
/// filesystem, so it roots the same layout under its temporary directory.
/// All accessors return paths as the sandbox itself sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    root: String,
}

impl Default for SandboxLayout {
    fn default() -> Self {
        Self::rooted("")
    }
}

impl SandboxLayout {
    /// Layout rooted under `root`. An empty root or `/` means the sandbox filesystem root.
    pub fn rooted(root: &str) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn join(&self, suffix: &str) -> String {
        format!("{}{}", self.root, suffix)
    }

    pub fn app_dir(&self) -> String {
        self.join(APP_DIR)
    }

    pub fn sdk_dir(&self) -> String {
        self.join(SDK_DIR)
    }

    pub fn runner_path(&self) -> String {
        self.join(RUNNER_PATH)
    }

    pub fn io_dir(&self) -> String {
        self.join(IO_DIR)
    }

    pub fn request_dir(&self) -> String {
        self.join(REQUEST_DIR)
    }

    pub fn response_dir(&self) -> String {
        self.join(RESPONSE_DIR)
    }

    pub fn log_file(&self) -> String {
        self.join(LOG_FILE)
    }

    pub fn config_path(&self) -> String {
        self.join(CONFIG_PATH)
    }

    pub fn artifact_dir(&self) -> String {
        self.join(ARTIFACT_DIR)
    }

    pub fn input_dir(&self) -> String {
        self.join(INPUT_DIR)
    }

    pub fn manifest_path(&self) -> String {
        self.join(MANIFEST_PATH)
    }

    pub fn workspace_dir(&self) -> String {
        self.join(WORKSPACE_DIR)
    }

    pub fn user_script(&self) -> String {
        self.join(USER_SCRIPT)
    }

    /// Directories that must exist before the bundle is written.
    pub fn directories(&self) -> Vec<String> {
        vec![
            self.app_dir(),
            self.sdk_dir(),
            self.io_dir(),
            self.request_dir(),
            self.response_dir(),
            self.artifact_dir(),
            self.input_dir(),
            self.workspace_dir(),
        ]
    }

    /// Whether `path` belongs to the RPC bridge's own directories.
    pub fn is_bridge_path(&self, path: &str) -> bool {
        [self.request_dir(), self.response_dir()].iter().any(|dir| {
            path.strip_prefix(dir.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    /// Strips the root prefix so the path reads as it would inside a container.
    pub fn relative(&self, path: &str) -> String {
        match path.strip_prefix(self.root.as_str()) {
            Some(rest) if !self.root.is_empty() => rest.to_string(),
            _ => path.to_string(),
        }
    }

    /// Inverse of [`SandboxLayout::relative`].
    pub fn absolute(&self, relative: &str) -> String {
        self.join(relative)
    }
}
