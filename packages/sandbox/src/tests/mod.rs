// ABOUTME: Scenario tests driving the whole engine against the in-memory substrate
// ABOUTME: Shared helpers for fast settings and recording log sinks

mod failure_tests;

use crate::settings::EngineSettings;
use crate::testing::MemoryProvider;
use crate::types::LogSink;
use crate::SandboxEngine;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn fast_settings() -> EngineSettings {
    EngineSettings {
        final_wait: Duration::from_secs(1),
        ..EngineSettings::default()
    }
    .with_timeout(Duration::from_secs(5))
    .with_tick_interval(Duration::from_millis(10))
}

pub(crate) fn engine(provider: &Arc<MemoryProvider>) -> SandboxEngine {
    SandboxEngine::new(provider.clone(), fast_settings())
}

/// Sink that keeps every batch it was called with
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    batches: Arc<Mutex<Vec<Vec<String>>>>,
}

impl RecordingSink {
    pub(crate) fn sink(&self) -> LogSink {
        let batches = self.batches.clone();
        Arc::new(move |lines: &[String]| batches.lock().unwrap().push(lines.to_vec()))
    }

    pub(crate) fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.batches().into_iter().flatten().collect()
    }
}
