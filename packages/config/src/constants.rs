// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Coderun

// Supervisor Timing
pub const CODERUN_TIMEOUT_SECS: &str = "CODERUN_TIMEOUT_SECS";
pub const CODERUN_TICK_MILLIS: &str = "CODERUN_TICK_MILLIS";
pub const CODERUN_RPC_TIMEOUT_SECS: &str = "CODERUN_RPC_TIMEOUT_SECS";

// Artifact Previews
pub const CODERUN_PREVIEW_MAX_BYTES: &str = "CODERUN_PREVIEW_MAX_BYTES";
pub const CODERUN_PREVIEW_CHARS: &str = "CODERUN_PREVIEW_CHARS";

// In-Sandbox Commands
pub const CODERUN_PYTHON: &str = "CODERUN_PYTHON";
pub const CODERUN_INSTALL_COMMAND: &str = "CODERUN_INSTALL_COMMAND";

// Durable Run Storage
pub const CODERUN_RUNS_ROOT: &str = "CODERUN_RUNS_ROOT";

// Execution Substrate
pub const CODERUN_PROVIDER: &str = "CODERUN_PROVIDER";
pub const CODERUN_IMAGE: &str = "CODERUN_IMAGE";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
