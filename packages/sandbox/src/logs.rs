// ABOUTME: Tails the shared sandbox log file by diffing against the count of lines already seen
// ABOUTME: Only newline-terminated lines are emitted while the run is live

use crate::providers::Sandbox;
use tracing::debug;

/// Incremental reader of the in-sandbox log file.
///
/// The file is re-read in full on every poll. Lines beyond the previously
/// seen count are returned once, in file order.
#[derive(Debug, Clone)]
pub struct LogTailer {
    path: String,
    lines: Vec<String>,
    tail_taken: bool,
}

impl LogTailer {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            lines: Vec::new(),
            tail_taken: false,
        }
    }

    /// Lines emitted so far
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    /// New complete lines since the last poll
    pub async fn poll(&mut self, sandbox: &dyn Sandbox) -> Vec<String> {
        self.read(sandbox, false).await
    }

    /// Like [`LogTailer::poll`], but also takes a trailing line that never got
    /// its newline. Used once the writer is gone.
    pub async fn finish(&mut self, sandbox: &dyn Sandbox) -> Vec<String> {
        self.read(sandbox, true).await
    }

    async fn read(&mut self, sandbox: &dyn Sandbox, include_partial: bool) -> Vec<String> {
        if self.tail_taken {
            return Vec::new();
        }

        let data = match sandbox.read_file(&self.path).await {
            Ok(data) => data,
            Err(e) => {
                debug!("Log file not readable yet: {}", e);
                return Vec::new();
            }
        };

        let current = split_lines(&String::from_utf8_lossy(&data), include_partial);
        if current.len() <= self.lines.len() {
            return Vec::new();
        }

        let fresh = current[self.lines.len()..].to_vec();
        self.lines.extend(fresh.iter().cloned());
        if include_partial && !data.ends_with(b"\n") {
            self.tail_taken = true;
        }
        fresh
    }
}

fn split_lines(text: &str, include_partial: bool) -> Vec<String> {
    let complete = match text.rfind('\n') {
        Some(end) if !include_partial => &text[..=end],
        None if !include_partial => "",
        _ => text,
    };

    complete
        .split_terminator('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect()
}
