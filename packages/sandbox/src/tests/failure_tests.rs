use super::{engine, fast_settings, RecordingSink};
use crate::bootstrap::LAUNCH_MARKER;
use crate::error::EngineError;
use crate::events::RunEvent;
use crate::providers::{ExecResult, Sandbox};
use crate::supervisor::{SandboxLease, CANCELLED_ERROR, TIMEOUT_ERROR};
use crate::testing::{entry, raised, returned, script, MemoryProvider, MemorySandbox};
use crate::types::{RunRequest, RunState};
use crate::SandboxEngine;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn failing_install() -> ExecResult {
    ExecResult {
        exit_code: 1,
        stdout: b"Collecting nope\n".to_vec(),
        stderr: b"ERROR: No matching distribution found for nope\n".to_vec(),
    }
}

#[tokio::test]
async fn test_provisioning_failure_is_an_error() {
    let provider = Arc::new(MemoryProvider::unavailable());

    let err = engine(&provider)
        .execute(&RunRequest::new("code"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Provisioning(_)));
    assert!(provider.sandboxes().is_empty());
}

#[tokio::test]
async fn test_install_failure_never_launches_runner() {
    let provider = Arc::new(
        MemoryProvider::new()
            .with_run_hook(|_, _| failing_install())
            .with_runner(entry(|_, _| async { returned("ok") })),
    );
    let recorder = RecordingSink::default();
    let request = RunRequest::new("code").with_dependencies(["nope"]);

    let outcome = engine(&provider)
        .execute(&request, Some(recorder.sink()))
        .await
        .unwrap();
    let result = outcome.result;

    assert!(!result.ok);
    assert_eq!(outcome.state, RunState::Failed);
    assert_eq!(
        result.error.as_deref(),
        Some("Dependency install exited with code 1: ERROR: No matching distribution found for nope")
    );
    assert!(result.logs.iter().all(|line| !line.contains(LAUNCH_MARKER)));
    assert_eq!(
        result.logs,
        vec!["Collecting nope", "ERROR: No matching distribution found for nope"]
    );
    assert_eq!(recorder.lines(), result.logs);

    let sandbox = provider.last();
    assert_eq!(sandbox.commands(), vec!["pip install -r /io/requirements.txt"]);
    assert_eq!(sandbox.destroy_count(), 1);
}

#[tokio::test]
async fn test_successful_install_precedes_runner() {
    let provider = Arc::new(
        MemoryProvider::new()
            .with_run_hook(|_, _| ExecResult {
                exit_code: 0,
                stdout: b"Successfully installed pandas\n".to_vec(),
                stderr: Vec::new(),
            })
            .with_runner(entry(|_, _| async { returned("ok") })),
    );
    let request = RunRequest::new("code").with_dependencies(["pandas", " "]);

    let outcome = engine(&provider).execute(&request, None).await.unwrap();

    assert!(outcome.result.ok);
    assert_eq!(
        provider.last().commands(),
        vec!["pip install -r /io/requirements.txt", "python /app/runner.py"]
    );
    assert!(outcome
        .result
        .logs
        .contains(&"Successfully installed pandas".to_string()));
}

#[tokio::test]
async fn test_uncaught_exception_surfaces_in_error() {
    let provider = Arc::new(MemoryProvider::new().with_runner(entry(|sandbox, _| async move {
        sandbox.log("about to fail");
        raised("KeyError: 'a'")
    })));

    let outcome = engine(&provider)
        .execute(&RunRequest::new("code"), None)
        .await
        .unwrap();
    let result = outcome.result;

    assert!(!result.ok);
    assert_eq!(outcome.state, RunState::Failed);
    assert_eq!(
        result.error.as_deref(),
        Some("Sandbox process exited with code 1: KeyError: 'a'")
    );
    assert!(result.logs.contains(&"about to fail".to_string()));
    assert!(result
        .logs
        .contains(&"Traceback (most recent call last):".to_string()));

    let mut unique = result.logs.clone();
    unique.dedup();
    assert_eq!(unique.len(), result.logs.len());
}

#[tokio::test]
async fn test_plain_non_zero_exit() {
    let provider = Arc::new(MemoryProvider::new().with_runner(script(|_| async {
        ExecResult {
            exit_code: 3,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    })));

    let result = engine(&provider)
        .execute(&RunRequest::new("code"), None)
        .await
        .unwrap()
        .result;

    assert_eq!(result.error.as_deref(), Some("Sandbox process exited with code 3"));
}

#[tokio::test]
async fn test_timeout_keeps_partial_logs() {
    let provider = Arc::new(MemoryProvider::new().with_runner(entry(|sandbox, _| async move {
        sandbox.log("step 1 done");
        sandbox.write_output("partial", serde_json::json!([1]));
        tokio::time::sleep(Duration::from_secs(10)).await;
        sandbox.log("never written");
        returned("late")
    })));
    let budget = Duration::from_millis(300);
    let engine = SandboxEngine::new(provider.clone(), fast_settings().with_timeout(budget));
    let recorder = RecordingSink::default();

    let started = Instant::now();
    let outcome = engine
        .execute(&RunRequest::new("code"), Some(recorder.sink()))
        .await
        .unwrap();
    let elapsed = started.elapsed();
    let result = outcome.result;

    assert!(!result.ok);
    assert_eq!(outcome.state, RunState::TimedOut);
    assert_eq!(result.error.as_deref(), Some(TIMEOUT_ERROR));
    assert!(elapsed >= budget);
    assert!(elapsed < budget + Duration::from_secs(2), "overshoot: {:?}", elapsed);
    assert!(result.logs.contains(&"step 1 done".to_string()));
    assert!(!result.logs.contains(&"never written".to_string()));
    assert!(recorder.lines().contains(&"step 1 done".to_string()));
    assert!(result
        .files
        .iter()
        .any(|f| f.path == "/io/artifacts/partial.json"));
    assert_eq!(provider.last().destroy_count(), 1);
}

#[tokio::test]
async fn test_cancelled_run_still_returns_partial_result() {
    let provider = Arc::new(MemoryProvider::new().with_runner(entry(|sandbox, _| async move {
        sandbox.log("working");
        tokio::time::sleep(Duration::from_secs(10)).await;
        returned("late")
    })));
    let mut handle = engine(&provider).spawn_run(RunRequest::new("code"));

    let mut saw_working = false;
    let mut terminal = None;
    while let Some(event) = handle.next_event().await {
        match event {
            RunEvent::Log { lines } => {
                if lines.iter().any(|line| line == "working") {
                    saw_working = true;
                    handle.cancel();
                }
            }
            other => terminal = Some(other),
        }
    }

    assert!(saw_working);
    match terminal {
        Some(RunEvent::Result { data }) => {
            assert!(!data.ok);
            assert_eq!(data.error.as_deref(), Some(CANCELLED_ERROR));
            assert!(data.logs.contains(&"working".to_string()));
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }
    let outcome = handle.join().await.unwrap().unwrap();
    assert_eq!(outcome.state, RunState::Cancelled);
    assert_eq!(provider.last().destroy_count(), 1);
}

#[tokio::test]
async fn test_spawned_provisioning_failure_emits_error_event() {
    let provider = Arc::new(MemoryProvider::unavailable());
    let mut handle = engine(&provider).spawn_run(RunRequest::new("code"));

    let event = handle.next_event().await;
    assert!(matches!(event, Some(RunEvent::Error { ref detail }) if detail.contains("provision")));
    assert!(handle.next_event().await.is_none());
    assert!(handle.join().await.unwrap().is_none());
}

#[tokio::test]
async fn test_dropped_lease_still_destroys_sandbox() {
    let sandbox = MemorySandbox::seeded();
    let lease = SandboxLease::new(sandbox.clone() as Arc<dyn Sandbox>);
    drop(lease);

    for _ in 0..50 {
        if sandbox.destroy_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(sandbox.destroy_count(), 1);
}

#[tokio::test]
async fn test_seeding_failure_still_yields_a_result() {
    let provider = Arc::new(
        MemoryProvider::new()
            .with_failing_write("/io/config.json")
            .with_runner(entry(|_, _| async { returned("ok") })),
    );

    let outcome = engine(&provider)
        .execute(&RunRequest::new("code"), None)
        .await
        .unwrap();
    let result = outcome.result;

    assert!(!result.ok);
    assert_eq!(outcome.state, RunState::Failed);
    let error = result.error.unwrap_or_default();
    assert!(error.starts_with("Failed to seed sandbox:"), "{}", error);
    assert!(!result.sandbox_id.is_empty());

    let sandbox = provider.last();
    assert!(sandbox.commands().is_empty());
    assert_eq!(sandbox.destroy_count(), 1);
}

#[tokio::test]
async fn test_install_failure_keeps_unterminated_log_tail() {
    let provider = Arc::new(MemoryProvider::new().with_run_hook(|sandbox, _| {
        sandbox.append(&sandbox.layout().log_file(), "resolver gave up");
        failing_install()
    }));
    let recorder = RecordingSink::default();
    let request = RunRequest::new("code").with_dependencies(["nope"]);

    let result = engine(&provider)
        .execute(&request, Some(recorder.sink()))
        .await
        .unwrap()
        .result;

    assert!(!result.ok);
    assert!(result.logs.contains(&"resolver gave up".to_string()));
    assert!(recorder.lines().contains(&"resolver gave up".to_string()));
}

#[tokio::test]
async fn test_slow_host_action_cannot_hold_off_timeout() {
    let provider = Arc::new(MemoryProvider::new().with_runner(entry(|sandbox, _| async move {
        sandbox.log("calling host");
        let reply = sandbox
            .rpc_call("slow", serde_json::json!({}), Duration::from_secs(10))
            .await;
        sandbox.log(&format!("reply={:?}", reply));
        returned("late")
    })));
    let actions = crate::HostActions::with_defaults().register("slow", |payload| {
        std::thread::sleep(Duration::from_secs(3));
        Ok(payload)
    });
    let budget = Duration::from_millis(300);
    let engine = SandboxEngine::new(provider.clone(), fast_settings().with_timeout(budget))
        .with_actions(actions);

    let started = Instant::now();
    let outcome = engine.execute(&RunRequest::new("code"), None).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.state, RunState::TimedOut);
    assert_eq!(outcome.result.error.as_deref(), Some(TIMEOUT_ERROR));
    assert!(elapsed < Duration::from_secs(2), "timeout held off for {:?}", elapsed);
    assert!(outcome.result.logs.contains(&"calling host".to_string()));
    assert_eq!(provider.last().destroy_count(), 1);
}

#[tokio::test]
async fn test_oversized_budgets_do_not_overflow() {
    let provider = Arc::new(MemoryProvider::new().with_runner(entry(|_, _| async { returned("ok") })));
    let settings = fast_settings()
        .with_timeout(Duration::from_secs(u64::MAX))
        .with_tick_interval(Duration::MAX);

    let outcome = SandboxEngine::new(provider.clone(), settings)
        .execute(&RunRequest::new("code"), None)
        .await
        .unwrap();

    assert!(outcome.result.ok, "error: {:?}", outcome.result.error);
    assert_eq!(outcome.state, RunState::Completed);
}
