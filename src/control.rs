//! Control operations on runs: submit, inspect, pause, resume, stop.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::brain::InstructionParser;
use crate::error::ControlError;
use crate::executor::RunExecutor;
use crate::hands::SessionBackend;
use crate::registry::RunStore;
use crate::types::{Action, Run, RunEvent, RunStatus, RunSummary, RunView, Step, StepBrief};

/// Returned by [`RunControl::submit`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submitted {
    pub run_id: String,
    pub steps: Vec<StepBrief>,
}

#[derive(Clone)]
pub struct RunControl {
    parser: Arc<dyn InstructionParser>,
    executor: RunExecutor,
    log_tail: usize,
}

impl RunControl {
    pub fn new(parser: Arc<dyn InstructionParser>, executor: RunExecutor, log_tail: usize) -> Self {
        Self {
            parser,
            executor,
            log_tail,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        self.executor.store()
    }

    pub fn sessions(&self) -> &Arc<dyn SessionBackend> {
        self.executor.sessions()
    }

    /// Parse the instruction, register a run and start executing it in the
    /// background.
    pub async fn submit(&self, instruction: &str) -> Result<Submitted, ControlError> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(ControlError::EmptyInstruction);
        }

        let mut steps = self.parser.parse(instruction);
        if steps.is_empty() {
            steps.push(Step::new(
                0,
                Action::DiagnosticInfo {
                    message: "the parser produced no steps for this instruction".to_string(),
                },
            ));
        }

        let run = Run::new(instruction, steps);
        let submitted = Submitted {
            run_id: run.id.clone(),
            steps: run.steps.iter().map(Step::brief).collect(),
        };
        info!(run_id = %submitted.run_id, steps = submitted.steps.len(), "run submitted");

        self.store().insert(run).await;
        self.executor.spawn(submitted.run_id.clone());
        Ok(submitted)
    }

    pub async fn status(&self, run_id: &str) -> Result<RunView, ControlError> {
        self.store()
            .get(run_id)
            .await
            .map(|run| run.view(self.log_tail))
            .ok_or_else(|| ControlError::RunNotFound(run_id.to_string()))
    }

    pub async fn list(&self) -> Vec<RunSummary> {
        self.store().list().await
    }

    /// `running -> paused`. Anything else is reported unchanged.
    pub async fn pause(&self, run_id: &str) -> Result<RunStatus, ControlError> {
        self.transition(run_id, RunStatus::Running, RunStatus::Paused, "paused by request")
            .await
    }

    /// `paused -> running`. Anything else is reported unchanged.
    pub async fn resume(&self, run_id: &str) -> Result<RunStatus, ControlError> {
        self.transition(run_id, RunStatus::Paused, RunStatus::Running, "resumed by request")
            .await
    }

    /// Stop a running or paused run and release its session right away.
    pub async fn stop(&self, run_id: &str) -> Result<RunStatus, ControlError> {
        let (status, session) = self
            .store()
            .modify(run_id, |run| {
                if run.status.is_terminal() {
                    return (run.status, None);
                }
                run.status = RunStatus::Stopped;
                run.log("stopped by request");
                (run.status, run.session_id.take())
            })
            .await
            .ok_or_else(|| ControlError::RunNotFound(run_id.to_string()))?;

        info!(run_id, %status, "stop requested");
        if let Some(session_id) = session {
            self.sessions().close(&session_id).await;
        }
        Ok(status)
    }

    pub async fn subscribe(
        &self,
        run_id: &str,
    ) -> Result<broadcast::Receiver<RunEvent>, ControlError> {
        self.store()
            .subscribe(run_id)
            .await
            .ok_or_else(|| ControlError::RunNotFound(run_id.to_string()))
    }

    async fn transition(
        &self,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
        line: &'static str,
    ) -> Result<RunStatus, ControlError> {
        let status = self
            .store()
            .modify(run_id, move |run| {
                if run.status == from {
                    run.status = to;
                    run.log(line);
                }
                run.status
            })
            .await
            .ok_or_else(|| ControlError::RunNotFound(run_id.to_string()))?;
        info!(run_id, requested = %to, %status, "transition requested");
        Ok(status)
    }
}
