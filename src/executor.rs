//! The run loop: open a session, execute each step in order, honor
//! pause/stop between steps, and always release the session at the end.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ExecutorConfig;
use crate::hands::{Frame, SessionBackend};
use crate::registry::RunStore;
use crate::types::{Action, RunStatus};

/// What the loop should do after a checkpoint.
enum Gate {
    Proceed,
    Halt,
}

/// Result of trying to move the next step to `running`.
enum Begin {
    Started(Action),
    /// The run is not `running` at the moment; go back to the checkpoint.
    Blocked,
    /// The step already left `queued`.
    Skip,
}

enum Outcome {
    Done { result: String, frame: Option<Frame> },
    Failed { error: String, frame: Option<Frame> },
}

/// Drives runs from the registry against a session backend.
#[derive(Clone)]
pub struct RunExecutor {
    store: Arc<dyn RunStore>,
    sessions: Arc<dyn SessionBackend>,
    config: ExecutorConfig,
}

impl RunExecutor {
    pub fn new(
        store: Arc<dyn RunStore>,
        sessions: Arc<dyn SessionBackend>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<dyn SessionBackend> {
        &self.sessions
    }

    /// Execute the run on its own task and return immediately.
    pub fn spawn(&self, run_id: String) -> JoinHandle<()> {
        let executor = self.clone();
        let span = info_span!("run", run_id = %run_id);
        tokio::spawn(async move { executor.execute(&run_id).await }.instrument(span))
    }

    /// Execute the run to a terminal state.
    pub async fn execute(&self, run_id: &str) {
        let Some(run) = self.store.get(run_id).await else {
            warn!(run_id, "run vanished before execution");
            return;
        };
        let started = Instant::now();
        let step_count = run.steps.len();
        info!(run_id, steps = step_count, "run starting");

        let opened = match self.sessions.open(None).await {
            Ok(opened) => opened,
            Err(e) => {
                error!(run_id, error = %e, "could not open browser session");
                let reason = e.to_string();
                self.store
                    .modify(run_id, move |run| {
                        if !run.status.is_terminal() {
                            run.status = RunStatus::Failed;
                        }
                        run.log(format!("could not open browser session: {reason}"));
                    })
                    .await;
                return;
            }
        };

        let session_id = opened.session_id.clone();
        {
            let session_id = session_id.clone();
            let frame = opened.frame;
            self.store
                .modify(run_id, move |run| {
                    run.log(format!("browser session {session_id} opened"));
                    run.session_id = Some(session_id);
                    run.current_location = Some(frame.location);
                    run.last_snapshot = frame.snapshot;
                })
                .await;
        }

        let fault = self
            .drive(run_id, &session_id, step_count, started)
            .await
            .err();
        self.finish(run_id, &session_id, fault).await;
    }

    async fn drive(
        &self,
        run_id: &str,
        session_id: &str,
        step_count: usize,
        started: Instant,
    ) -> Result<(), String> {
        for index in 0..step_count {
            let action = loop {
                if let Gate::Halt = self.checkpoint(run_id).await? {
                    return Ok(());
                }
                if index >= self.config.max_steps {
                    return Err(format!("step limit of {} reached", self.config.max_steps));
                }
                self.within_time(started)?;
                match self.begin(run_id, index).await? {
                    Begin::Started(action) => break Some(action),
                    Begin::Blocked => continue,
                    Begin::Skip => break None,
                }
            };
            let Some(action) = action else {
                continue;
            };

            let outcome = self.bounded(session_id, &action, started).await;
            self.record(run_id, index, outcome).await?;

            if index + 1 < step_count {
                tokio::time::sleep(self.config.step_delay).await;
            }
        }

        // A pause requested during the last step still holds the run.
        if let Gate::Halt = self.checkpoint(run_id).await? {
            return Ok(());
        }
        self.within_time(started)
    }

    fn within_time(&self, started: Instant) -> Result<(), String> {
        match self.config.run_timeout {
            Some(limit) if started.elapsed() >= limit => {
                Err(format!("run time limit of {}ms reached", limit.as_millis()))
            }
            _ => Ok(()),
        }
    }

    /// Suspension point between steps. Waits while the run is paused.
    async fn checkpoint(&self, run_id: &str) -> Result<Gate, String> {
        let mut status = self
            .store
            .watch_status(run_id)
            .await
            .ok_or_else(|| vanished(run_id))?;

        loop {
            let current = *status.borrow_and_update();
            match current {
                RunStatus::Running => return Ok(Gate::Proceed),
                RunStatus::Paused => {
                    debug!(run_id, "run paused, waiting");
                    // Resume/stop wake us early; the poll interval bounds the wait.
                    match tokio::time::timeout(self.config.pause_poll, status.changed()).await {
                        Ok(Err(_)) => tokio::time::sleep(self.config.pause_poll).await,
                        Ok(Ok(())) | Err(_) => {}
                    }
                }
                RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped => {
                    return Ok(Gate::Halt);
                }
            }
        }
    }

    async fn begin(&self, run_id: &str, index: usize) -> Result<Begin, String> {
        self.store
            .modify(run_id, move |run| {
                if run.status != RunStatus::Running {
                    return Begin::Blocked;
                }
                let Some(step) = run.steps.get_mut(index) else {
                    return Begin::Skip;
                };
                if !step.begin() {
                    return Begin::Skip;
                }
                let line = format!("{} running: {}", step.id, step.action.name());
                let action = step.action.clone();
                run.log(line);
                Begin::Started(action)
            })
            .await
            .ok_or_else(|| vanished(run_id))
    }

    /// Perform `action` within the wait ceiling and what is left of the run
    /// time limit.
    async fn bounded(&self, session_id: &str, action: &Action, started: Instant) -> Outcome {
        if let Action::Wait { ms } = action {
            let limit = self.config.max_wait.as_millis();
            if u128::from(*ms) > limit {
                return Outcome::Failed {
                    error: format!("wait of {ms}ms exceeds the {limit}ms limit"),
                    frame: None,
                };
            }
        }

        let Some(limit) = self.config.run_timeout else {
            return self.perform(session_id, action).await;
        };
        let remaining = limit.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, self.perform(session_id, action)).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Failed {
                error: format!(
                    "{} interrupted by the run time limit of {}ms",
                    action.name(),
                    limit.as_millis()
                ),
                frame: None,
            },
        }
    }

    async fn perform(&self, session_id: &str, action: &Action) -> Outcome {
        match action {
            Action::DiagnosticInfo { message } => Outcome::Done {
                result: message.clone(),
                frame: None,
            },
            Action::DiagnosticError { message } => Outcome::Failed {
                error: message.clone(),
                frame: None,
            },
            Action::Screenshot => match self.sessions.screenshot(session_id).await {
                Ok(frame) => Outcome::Done {
                    result: "completed".to_string(),
                    frame: Some(frame),
                },
                Err(e) => Outcome::Failed {
                    error: e.to_string(),
                    frame: None,
                },
            },
            action => match self.sessions.step(session_id, action).await {
                Ok(frame) => Outcome::Done {
                    result: "completed".to_string(),
                    frame: Some(frame),
                },
                Err(failure) => Outcome::Failed {
                    error: failure.error.to_string(),
                    frame: failure.frame,
                },
            },
        }
    }

    async fn record(&self, run_id: &str, index: usize, outcome: Outcome) -> Result<(), String> {
        let logged = self
            .store
            .modify(run_id, move |run| {
                let (frame, line) = {
                    let step = &mut run.steps[index];
                    match outcome {
                        Outcome::Done { result, frame } => {
                            step.succeed(result);
                            (frame, format!("{} done: {}", step.id, step.action.name()))
                        }
                        Outcome::Failed { error, frame } => {
                            let line = format!("{} failed: {error}", step.id);
                            step.fail(error);
                            (frame, line)
                        }
                    }
                };
                if let Some(frame) = frame {
                    run.current_location = Some(frame.location);
                    if frame.snapshot.is_some() {
                        run.last_snapshot = frame.snapshot;
                    }
                }
                run.log(&line);
                line
            })
            .await
            .ok_or_else(|| vanished(run_id))?;
        info!(run_id, "{logged}");
        Ok(())
    }

    async fn finish(&self, run_id: &str, session_id: &str, fault: Option<String>) {
        let attached = self
            .store
            .modify(run_id, move |run| {
                if let Some(reason) = fault {
                    if !run.status.is_terminal() {
                        run.status = RunStatus::Failed;
                    }
                    run.log(format!("run aborted: {reason}"));
                } else if run.status == RunStatus::Running {
                    run.status = RunStatus::Completed;
                }
                let status = run.status;
                run.log(format!("run finished: {status}"));
                (status, run.session_id.take())
            })
            .await;

        let to_close = match attached {
            Some((status, attached)) => {
                info!(run_id, %status, "run finished");
                attached
            }
            None => {
                warn!(run_id, "run vanished during execution");
                Some(session_id.to_string())
            }
        };

        // Stop may already have released the session.
        if let Some(session_id) = to_close {
            self.sessions.close(&session_id).await;
        }
    }
}

fn vanished(run_id: &str) -> String {
    format!("run {run_id} is no longer in the registry")
}
