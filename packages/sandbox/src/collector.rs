// ABOUTME: Post-run sweep of the sandbox output roots building artifact metadata
// ABOUTME: Iterative traversal that skips the RPC bridge directories and never aborts on one bad file

use crate::layout::SandboxLayout;
use crate::providers::{EntryKind, Sandbox, SandboxEntry};
use crate::settings::EngineSettings;
use crate::types::ArtifactFile;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub struct ArtifactCollector<'a> {
    layout: &'a SandboxLayout,
    preview_max_bytes: u64,
    preview_chars: usize,
}

impl<'a> ArtifactCollector<'a> {
    pub fn new(layout: &'a SandboxLayout, settings: &EngineSettings) -> Self {
        Self {
            layout,
            preview_max_bytes: settings.preview_max_bytes,
            preview_chars: settings.preview_chars,
        }
    }

    /// Artifact directory first, then the rest of the I/O directory
    pub fn roots(&self) -> Vec<String> {
        vec![self.layout.artifact_dir(), self.layout.io_dir()]
    }

    /// Every regular file under the roots, de-duplicated and sorted by path.
    /// Paths are reported relative to the sandbox root.
    pub async fn collect(&self, sandbox: &dyn Sandbox) -> Vec<ArtifactFile> {
        let mut files = BTreeMap::new();

        for root in self.roots() {
            let mut pending: Vec<SandboxEntry> = match sandbox.list_dir(&root).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Skipping collection root {}: {}", root, e);
                    continue;
                }
            };

            while let Some(entry) = pending.pop() {
                if entry.path.is_empty() || self.layout.is_bridge_path(&entry.path) {
                    continue;
                }

                match entry.kind {
                    EntryKind::Dir => match sandbox.list_dir(&entry.path).await {
                        Ok(children) => pending.extend(children),
                        Err(e) => warn!("Failed to list {}: {}", entry.path, e),
                    },
                    EntryKind::File => {
                        let file = self.describe(sandbox, &entry).await;
                        files.insert(file.path.clone(), file);
                    }
                    EntryKind::Other => {}
                }
            }
        }

        files.into_values().collect()
    }

    async fn describe(&self, sandbox: &dyn Sandbox, entry: &SandboxEntry) -> ArtifactFile {
        let content = match sandbox.read_file(&entry.path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read artifact {}: {}", entry.path, e);
                Vec::new()
            }
        };

        let size_bytes = entry.size.unwrap_or(content.len() as u64);
        let preview = if !content.is_empty() && size_bytes <= self.preview_max_bytes {
            std::str::from_utf8(&content)
                .ok()
                .map(|text| text.chars().take(self.preview_chars).collect())
        } else {
            None
        };

        ArtifactFile {
            path: self.layout.relative(&entry.path),
            size_bytes,
            preview,
        }
    }
}
