mod common;

use std::time::Duration;

use agentic_rpa::config::ExecutorConfig;
use agentic_rpa::types::{RunStatus, StepStatus};
use common::{Call, ScriptedBackend, fast_config, harness, settle, wait_until};

const FIVE_STEPS: &str =
    r#"go to example.com, click "Sign in", type "hello" into "email", wait 1 ms and take a screenshot"#;

#[tokio::test]
async fn happy_path_completes_and_closes_once() {
    let h = harness(ScriptedBackend::new(), fast_config());
    let submitted = h.control.submit(FIVE_STEPS).await.unwrap();
    assert_eq!(submitted.steps.len(), 5);

    let run = settle(&h.control, &submitted.run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.steps.iter().all(|s| s.status == StepStatus::Done));
    assert_eq!(run.last_snapshot.as_deref(), Some("sess-test-99.png"));
    assert_eq!(run.current_location.as_deref(), Some("https://example.com/"));

    assert_eq!(
        h.backend.calls(),
        vec![
            Call::Open,
            Call::Step("navigate".into()),
            Call::Step("click".into()),
            Call::Step("type".into()),
            Call::Step("wait".into()),
            Call::Screenshot,
            Call::Close("sess-test".into()),
        ]
    );
    assert_eq!(h.backend.open_sessions(), 0);
}

#[tokio::test]
async fn a_failed_step_does_not_stop_the_rest() {
    let h = harness(ScriptedBackend::new().failing_step(2), fast_config());
    let submitted = h.control.submit(FIVE_STEPS).await.unwrap();

    let run = settle(&h.control, &submitted.run_id).await;
    assert_eq!(run.status, RunStatus::Completed);

    let statuses: Vec<StepStatus> = run.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Done,
            StepStatus::Done,
            StepStatus::Failed,
            StepStatus::Done,
            StepStatus::Done,
        ]
    );
    let failed = &run.steps[2];
    assert!(failed.error.as_deref().unwrap().contains("element not found"));
    assert!(failed.result.is_none());
    assert!(run.logs.iter().any(|l| l.contains("step-3 failed")));
    assert_eq!(h.backend.closes(), 1);
}

#[tokio::test]
async fn open_failure_fails_the_run_without_a_session() {
    let h = harness(ScriptedBackend::new().failing_open(), fast_config());
    let submitted = h.control.submit(FIVE_STEPS).await.unwrap();

    let run = settle(&h.control, &submitted.run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.steps.iter().all(|s| s.status == StepStatus::Queued));
    assert!(run.logs.iter().any(|l| l.contains("could not open browser session")));
    assert_eq!(h.backend.calls(), vec![Call::Open]);
}

#[tokio::test]
async fn diagnostic_only_runs_still_complete() {
    let h = harness(ScriptedBackend::new(), fast_config());
    let submitted = h.control.submit("make me a sandwich").await.unwrap();
    assert_eq!(submitted.steps[0].action, "diagnostic-info");

    let run = settle(&h.control, &submitted.run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.steps[0].status, StepStatus::Done);
    assert!(run.steps[0].result.as_deref().unwrap().contains("zillow.com"));
    assert_eq!(h.backend.closes(), 1);
}

#[tokio::test]
async fn blocked_navigation_surfaces_as_a_failed_step() {
    let h = harness(ScriptedBackend::new(), fast_config());
    let submitted = h.control.submit("go to file:///etc/passwd").await.unwrap();
    assert_eq!(submitted.steps.len(), 1);

    let run = settle(&h.control, &submitted.run_id).await;
    assert_eq!(run.steps[0].status, StepStatus::Failed);
    assert!(run.steps[0].error.as_deref().unwrap().contains("file"));
    assert!(
        !h.backend
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Step(_)))
    );
}

#[tokio::test]
async fn pause_holds_the_run_until_resumed() {
    let h = harness(
        ScriptedBackend::new().slow(Duration::from_millis(50)),
        fast_config(),
    );
    let submitted = h.control.submit(FIVE_STEPS).await.unwrap();
    let id = submitted.run_id.clone();

    wait_until(&h.control, &id, |run| run.steps[0].status == StepStatus::Running).await;
    assert_eq!(h.control.pause(&id).await.unwrap(), RunStatus::Paused);
    // A second pause is a no-op.
    assert_eq!(h.control.pause(&id).await.unwrap(), RunStatus::Paused);

    // The in-flight step finishes, nothing else starts.
    wait_until(&h.control, &id, |run| run.steps[0].status == StepStatus::Done).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let held = h.control.store().get(&id).await.unwrap();
    assert_eq!(held.status, RunStatus::Paused);
    assert_eq!(held.steps[1].status, StepStatus::Queued);

    assert_eq!(h.control.resume(&id).await.unwrap(), RunStatus::Running);
    let run = settle(&h.control, &id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.steps.iter().all(|s| s.status == StepStatus::Done));
    assert_eq!(h.backend.closes(), 1);
}

#[tokio::test]
async fn resume_only_applies_to_paused_runs() {
    let h = harness(
        ScriptedBackend::new().slow(Duration::from_millis(50)),
        fast_config(),
    );
    let submitted = h.control.submit(FIVE_STEPS).await.unwrap();
    assert_eq!(
        h.control.resume(&submitted.run_id).await.unwrap(),
        RunStatus::Running
    );
    h.control.stop(&submitted.run_id).await.unwrap();
    assert_eq!(
        h.control.resume(&submitted.run_id).await.unwrap(),
        RunStatus::Stopped
    );
    assert_eq!(
        h.control.pause(&submitted.run_id).await.unwrap(),
        RunStatus::Stopped
    );
}

#[tokio::test]
async fn stop_mid_run_releases_the_session_once() {
    let h = harness(
        ScriptedBackend::new().slow(Duration::from_millis(50)),
        fast_config(),
    );
    let submitted = h.control.submit(FIVE_STEPS).await.unwrap();
    let id = submitted.run_id.clone();

    wait_until(&h.control, &id, |run| run.steps[1].status == StepStatus::Running).await;
    assert_eq!(h.control.stop(&id).await.unwrap(), RunStatus::Stopped);

    let run = settle(&h.control, &id).await;
    assert_eq!(run.status, RunStatus::Stopped);
    assert_eq!(run.steps[0].status, StepStatus::Done);
    assert!(run.steps[3..].iter().all(|s| s.status == StepStatus::Queued));
    assert!(run.logs.iter().any(|l| l.contains("stopped by request")));

    // Stopping again changes nothing and closes nothing.
    assert_eq!(h.control.stop(&id).await.unwrap(), RunStatus::Stopped);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.backend.closes(), 1);
    assert_eq!(h.backend.open_sessions(), 0);
}

#[tokio::test]
async fn stop_while_paused_never_resumes() {
    let h = harness(
        ScriptedBackend::new().slow(Duration::from_millis(30)),
        fast_config(),
    );
    let submitted = h.control.submit(FIVE_STEPS).await.unwrap();
    let id = submitted.run_id.clone();

    wait_until(&h.control, &id, |run| run.steps[0].status == StepStatus::Running).await;
    h.control.pause(&id).await.unwrap();
    h.control.stop(&id).await.unwrap();

    let run = settle(&h.control, &id).await;
    assert_eq!(run.status, RunStatus::Stopped);
    assert!(run.steps[1..].iter().all(|s| s.status == StepStatus::Queued));
    assert_eq!(h.backend.closes(), 1);
}

#[tokio::test]
async fn step_ceiling_fails_the_run() {
    let config = ExecutorConfig {
        max_steps: 2,
        ..fast_config()
    };
    let h = harness(ScriptedBackend::new(), config);
    let submitted = h.control.submit(FIVE_STEPS).await.unwrap();

    let run = settle(&h.control, &submitted.run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.steps[1].status, StepStatus::Done);
    assert_eq!(run.steps[2].status, StepStatus::Queued);
    assert!(run.logs.iter().any(|l| l.contains("step limit of 2 reached")));
    assert_eq!(h.backend.closes(), 1);
}

#[tokio::test]
async fn run_timeout_fails_the_run() {
    let config = ExecutorConfig {
        run_timeout: Some(Duration::from_millis(60)),
        ..fast_config()
    };
    let h = harness(
        ScriptedBackend::new().slow(Duration::from_millis(40)),
        config,
    );
    let submitted = h.control.submit(FIVE_STEPS).await.unwrap();

    let run = settle(&h.control, &submitted.run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.logs.iter().any(|l| l.contains("run time limit")));
    assert_eq!(run.steps[4].status, StepStatus::Queued);
    assert_eq!(h.backend.closes(), 1);
}

#[tokio::test]
async fn events_follow_the_run() {
    let h = harness(
        ScriptedBackend::new().slow(Duration::from_millis(20)),
        fast_config(),
    );
    let submitted = h.control.submit("go to example.com").await.unwrap();
    let mut events = h.control.subscribe(&submitted.run_id).await.unwrap();

    let mut saw_completed = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !saw_completed {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("events arrive in time")
            .expect("channel open");
        if let agentic_rpa::types::RunEvent::Status { status } = event {
            saw_completed = status == RunStatus::Completed;
        }
    }
}

#[tokio::test]
async fn oversized_waits_fail_without_reaching_the_browser() {
    let config = ExecutorConfig {
        max_wait: Duration::from_millis(50),
        ..fast_config()
    };
    let h = harness(ScriptedBackend::new(), config);
    let submitted = h
        .control
        .submit("wait 99999999999 seconds and take a screenshot")
        .await
        .unwrap();

    let run = settle(&h.control, &submitted.run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.steps[0].status, StepStatus::Failed);
    assert!(run.steps[0].error.as_deref().unwrap().contains("exceeds the 50ms limit"));
    assert_eq!(run.steps[1].status, StepStatus::Done);
    assert!(!h.backend.calls().contains(&Call::Step("wait".into())));
}

#[tokio::test]
async fn run_timeout_interrupts_a_long_step() {
    let config = ExecutorConfig {
        run_timeout: Some(Duration::from_millis(100)),
        ..fast_config()
    };
    let h = harness(ScriptedBackend::new(), config);
    let submitted = h.control.submit("wait 30 seconds").await.unwrap();

    let started = tokio::time::Instant::now();
    let run = settle(&h.control, &submitted.run_id).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(run.status, RunStatus::Failed);
    assert!(
        run.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("interrupted by the run time limit")
    );
    assert!(run.logs.iter().any(|l| l.contains("run time limit of 100ms reached")));
    assert_eq!(h.backend.closes(), 1);
    assert_eq!(h.backend.open_sessions(), 0);
}

#[tokio::test]
async fn stop_during_open_still_closes_the_late_session_once() {
    let h = harness(
        ScriptedBackend::new().slow_open(Duration::from_millis(100)),
        fast_config(),
    );
    let submitted = h.control.submit(FIVE_STEPS).await.unwrap();
    let id = submitted.run_id.clone();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !h.backend.calls().contains(&Call::Open) {
        assert!(tokio::time::Instant::now() < deadline, "open never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.control.stop(&id).await.unwrap(), RunStatus::Stopped);
    assert_eq!(h.backend.closes(), 0);

    let run = settle(&h.control, &id).await;
    assert_eq!(run.status, RunStatus::Stopped);
    assert!(run.steps.iter().all(|s| s.status == StepStatus::Queued));
    assert_eq!(h.backend.closes(), 1);
    assert_eq!(h.backend.open_sessions(), 0);
    assert!(
        !h.backend
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Step(_) | Call::Screenshot))
    );
}
