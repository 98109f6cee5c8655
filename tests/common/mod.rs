//! Scripted session backend shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentic_rpa::config::ExecutorConfig;
use agentic_rpa::control::RunControl;
use agentic_rpa::error::SessionError;
use agentic_rpa::executor::RunExecutor;
use agentic_rpa::hands::{Frame, OpenedSession, SessionBackend, StepFailure};
use agentic_rpa::registry::{MemoryRunStore, RunStore};
use agentic_rpa::types::{Action, Run, RunStatus};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Open,
    Step(String),
    Screenshot,
    Close(String),
}

/// Records every call and fails on request. Nothing touches a browser.
#[derive(Default)]
pub struct ScriptedBackend {
    calls: Mutex<Vec<Call>>,
    open: Mutex<HashSet<String>>,
    failing_steps: HashSet<usize>,
    fail_open: bool,
    step_delay: Duration,
    open_delay: Duration,
    step_counter: Mutex<usize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the n-th (zero-based) browser step this backend receives.
    pub fn failing_step(mut self, n: usize) -> Self {
        self.failing_steps.insert(n);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn slow_open(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Close(_)))
            .count()
    }

    pub fn open_sessions(&self) -> usize {
        self.open.lock().unwrap().len()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn frame(session_id: &str, n: usize) -> Frame {
        Frame {
            snapshot: Some(format!("{session_id}-{n}.png")),
            location: "https://example.com/".to_string(),
        }
    }
}

#[async_trait]
impl SessionBackend for ScriptedBackend {
    async fn open(&self, _location: Option<&str>) -> Result<OpenedSession, SessionError> {
        self.record(Call::Open);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if self.fail_open {
            return Err(SessionError::LaunchFailed("no browser here".to_string()));
        }
        let session_id = "sess-test".to_string();
        self.open.lock().unwrap().insert(session_id.clone());
        Ok(OpenedSession {
            frame: Self::frame(&session_id, 0),
            session_id,
        })
    }

    async fn step(&self, session_id: &str, action: &Action) -> Result<Frame, StepFailure> {
        self.record(Call::Step(action.name().to_string()));
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
        if let Action::Wait { ms } = action {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        let n = {
            let mut counter = self.step_counter.lock().unwrap();
            let n = *counter;
            *counter += 1;
            n
        };
        if !self.open.lock().unwrap().contains(session_id) {
            return Err(SessionError::UnknownSession(session_id.to_string()).into());
        }
        if self.failing_steps.contains(&n) {
            return Err(StepFailure {
                error: SessionError::ElementNotFound("#missing".to_string()),
                frame: Some(Self::frame(session_id, n + 1)),
            });
        }
        Ok(Self::frame(session_id, n + 1))
    }

    async fn screenshot(&self, session_id: &str) -> Result<Frame, SessionError> {
        self.record(Call::Screenshot);
        if !self.open.lock().unwrap().contains(session_id) {
            return Err(SessionError::UnknownSession(session_id.to_string()));
        }
        Ok(Self::frame(session_id, 99))
    }

    async fn close(&self, session_id: &str) -> bool {
        self.record(Call::Close(session_id.to_string()));
        self.open.lock().unwrap().remove(session_id)
    }
}

pub fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        step_delay: Duration::from_millis(5),
        pause_poll: Duration::from_millis(10),
        ..Default::default()
    }
}

pub struct Harness {
    pub control: RunControl,
    pub backend: Arc<ScriptedBackend>,
}

pub fn harness(backend: ScriptedBackend, config: ExecutorConfig) -> Harness {
    let backend = Arc::new(backend);
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let executor = RunExecutor::new(store, backend.clone(), config);
    let control = RunControl::new(
        Arc::new(agentic_rpa::brain::HeuristicParser),
        executor,
        50,
    );
    Harness { control, backend }
}

/// Poll until the run is terminal and its session has been released.
pub async fn settle(control: &RunControl, run_id: &str) -> Run {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let run = control.store().get(run_id).await.expect("run exists");
        if run.status.is_terminal() && run.session_id.is_none() && finished(&run) {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} did not settle: {:?}",
            run.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn finished(run: &Run) -> bool {
    run.logs.iter().any(|l| l.contains("run finished"))
        || (run.status == RunStatus::Failed && run.session_id.is_none())
}

/// Poll until `predicate` holds for the run.
pub async fn wait_until(control: &RunControl, run_id: &str, predicate: impl Fn(&Run) -> bool) -> Run {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let run = control.store().get(run_id).await.expect("run exists");
        if predicate(&run) {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition never held for run {run_id}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
