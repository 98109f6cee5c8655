use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// How a selector string is interpreted by the browser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorEngine {
    /// `document.querySelector` syntax.
    #[default]
    Css,
    /// XPath 1.0 expression.
    Xpath,
}

/// A single atomic unit of automation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "arguments", rename_all = "kebab-case")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
        #[serde(default)]
        engine: SelectorEngine,
    },
    Type {
        selector: String,
        #[serde(default)]
        engine: SelectorEngine,
        text: String,
    },
    WaitForElement {
        selector: String,
        #[serde(default)]
        engine: SelectorEngine,
    },
    Wait {
        ms: u64,
    },
    Screenshot,
    /// Resolved by the executor as `done`, carrying `message` as the result.
    DiagnosticInfo {
        message: String,
    },
    /// Resolved by the executor as `failed`, carrying `message` as the error.
    DiagnosticError {
        message: String,
    },
}

const ACTION_NAMES: [&str; 8] = [
    "navigate",
    "click",
    "type",
    "wait-for-element",
    "wait",
    "screenshot",
    "diagnostic-info",
    "diagnostic-error",
];

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::Type { .. } => "type",
            Action::WaitForElement { .. } => "wait-for-element",
            Action::Wait { .. } => "wait",
            Action::Screenshot => "screenshot",
            Action::DiagnosticInfo { .. } => "diagnostic-info",
            Action::DiagnosticError { .. } => "diagnostic-error",
        }
    }

    pub fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            Action::DiagnosticInfo { .. } | Action::DiagnosticError { .. }
        )
    }

    /// Build an action from a wire-level `(action, arguments)` pair.
    pub fn from_parts(action: &str, arguments: serde_json::Value) -> Result<Self, SessionError> {
        if !ACTION_NAMES.contains(&action) {
            return Err(SessionError::UnknownAction(action.to_string()));
        }
        if action == "screenshot" {
            return Ok(Action::Screenshot);
        }
        let arguments = match arguments {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        serde_json::from_value(serde_json::json!({ "action": action, "arguments": arguments }))
            .map_err(|e| SessionError::InvalidArguments(format!("{action}: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Queued,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(flatten)]
    pub action: Action,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    pub fn new(index: usize, action: Action) -> Self {
        Self {
            id: format!("step-{}", index + 1),
            action,
            status: StepStatus::Queued,
            result: None,
            error: None,
        }
    }

    /// `queued -> running`. Returns false if the step already left `queued`.
    pub fn begin(&mut self) -> bool {
        if self.status != StepStatus::Queued {
            return false;
        }
        self.status = StepStatus::Running;
        true
    }

    pub fn succeed(&mut self, result: impl Into<String>) -> bool {
        if self.status != StepStatus::Running {
            return false;
        }
        self.status = StepStatus::Done;
        self.result = Some(result.into());
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.status != StepStatus::Running {
            return false;
        }
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        true
    }

    pub fn brief(&self) -> StepBrief {
        StepBrief {
            id: self.id.clone(),
            action: self.action.name(),
            status: self.status,
        }
    }
}

/// Shallow view of a step returned by submit.
#[derive(Debug, Clone, Serialize)]
pub struct StepBrief {
    pub id: String,
    pub action: &'static str,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One execution of a parsed instruction.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,
    pub instruction: String,
    pub status: RunStatus,
    pub steps: Vec<Step>,
    pub session_id: Option<String>,
    pub current_location: Option<String>,
    pub last_snapshot: Option<String>,
    pub logs: VecDeque<String>,
    /// Total number of log lines ever appended, including dropped ones.
    pub log_seq: u64,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(instruction: impl Into<String>, steps: Vec<Step>) -> Self {
        let mut run = Self {
            id: uuid::Uuid::new_v4().to_string(),
            instruction: instruction.into(),
            status: RunStatus::Running,
            steps,
            session_id: None,
            current_location: None,
            last_snapshot: None,
            logs: VecDeque::new(),
            log_seq: 0,
            created_at: Utc::now(),
        };
        let count = run.steps.len();
        run.log(format!("run created with {count} step(s)"));
        run
    }

    pub fn log(&mut self, message: impl AsRef<str>) {
        let line = format!(
            "[{}] {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            message.as_ref()
        );
        if self.logs.len() >= MAX_RUN_LOG_LINES {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
        self.log_seq += 1;
    }

    /// The most recent `n` log lines, oldest first.
    pub fn log_tail(&self, n: usize) -> Vec<String> {
        let skip = self.logs.len().saturating_sub(n);
        self.logs.iter().skip(skip).cloned().collect()
    }

    pub fn view(&self, tail: usize) -> RunView {
        RunView {
            run_id: self.id.clone(),
            instruction: self.instruction.clone(),
            status: self.status,
            steps: self.steps.clone(),
            current_location: self.current_location.clone(),
            last_snapshot: self.last_snapshot.clone(),
            logs: self.log_tail(tail.max(MIN_LOG_TAIL)),
            created_at: self.created_at,
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id.clone(),
            status: self.status,
            steps: self.steps.len(),
            created_at: self.created_at,
        }
    }
}

/// Externally visible state of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub run_id: String,
    pub instruction: String,
    pub status: RunStatus,
    pub steps: Vec<Step>,
    pub current_location: Option<String>,
    pub last_snapshot: Option<String>,
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub steps: usize,
    pub created_at: DateTime<Utc>,
}

/// Change notifications published by the run store.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Status {
        status: RunStatus,
    },
    Step {
        step_id: String,
        status: StepStatus,
        detail: Option<String>,
    },
    Log {
        line: String,
    },
}

pub const DEFAULT_MAX_STEPS: usize = 25;
pub const MAX_RUN_LOG_LINES: usize = 1000;
pub const MIN_LOG_TAIL: usize = 50;
