// ABOUTME: Optional dependency install step run before the entry runner is launched
// ABOUTME: Writes the requirements manifest and runs the configured install command

use crate::layout::SandboxLayout;
use crate::providers::Sandbox;
use crate::settings::EngineSettings;
use tracing::{info, warn};

/// What the install step produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstallOutcome {
    /// Combined installer output, one entry per non-empty line
    pub lines: Vec<String>,
    /// Set when the install failed; the run must not proceed
    pub error: Option<String>,
}

impl InstallOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct DependencyInstaller<'a> {
    layout: &'a SandboxLayout,
    settings: &'a EngineSettings,
}

impl<'a> DependencyInstaller<'a> {
    pub fn new(layout: &'a SandboxLayout, settings: &'a EngineSettings) -> Self {
        Self { layout, settings }
    }

    /// Newline-joined manifest, or `None` when nothing is requested
    pub fn manifest(packages: &[String]) -> Option<String> {
        let names: Vec<&str> = packages
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();

        if names.is_empty() {
            None
        } else {
            Some(names.join("\n"))
        }
    }

    /// Install `packages`. Returns `None` when the step is skipped.
    pub async fn install(&self, sandbox: &dyn Sandbox, packages: &[String]) -> Option<InstallOutcome> {
        let manifest = Self::manifest(packages)?;
        let manifest_path = self.layout.manifest_path();

        if let Err(e) = sandbox.write_file(&manifest_path, manifest.as_bytes()).await {
            warn!("Failed to write requirements manifest: {}", e);
            return Some(InstallOutcome {
                lines: Vec::new(),
                error: Some(format!("Failed to write requirements manifest: {}", e)),
            });
        }

        let command = self.settings.install_command_for(&manifest_path);
        info!(
            "Installing {} package(s) in sandbox {}",
            manifest.lines().count(),
            sandbox.id()
        );

        let result = match sandbox.run(&command).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Install command could not run: {}", e);
                return Some(InstallOutcome {
                    lines: Vec::new(),
                    error: Some(format!("Dependency install failed: {}", e)),
                });
            }
        };

        let error = (!result.success()).then(|| {
            let mut message = format!("Dependency install exited with code {}", result.exit_code);
            if let Some(summary) = result.error_summary() {
                message.push_str(": ");
                message.push_str(&summary);
            }
            message
        });

        Some(InstallOutcome {
            lines: result.output_lines(),
            error,
        })
    }
}
