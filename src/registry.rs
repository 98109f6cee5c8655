//! Run registry: where run records live while they execute and afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast, oneshot, watch};

use crate::types::{Run, RunEvent, RunStatus, RunSummary, StepStatus};

/// An in-place edit of one run, applied under that run's write guard.
pub type Mutation = Box<dyn FnOnce(&mut Run) + Send>;

/// Storage for run records.
///
/// Implementations must serialize mutations per run and must not make reads
/// of one run wait on writes to another.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert(&self, run: Run);

    /// A point-in-time copy of the run.
    async fn get(&self, id: &str) -> Option<Run>;

    /// Apply `mutation` to the run. Returns false if the run is unknown.
    async fn update(&self, id: &str, mutation: Mutation) -> bool;

    /// Newest first.
    async fn list(&self) -> Vec<RunSummary>;

    /// Receives the run status every time it changes.
    async fn watch_status(&self, id: &str) -> Option<watch::Receiver<RunStatus>>;

    async fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<RunEvent>>;
}

impl dyn RunStore {
    /// Run `f` against the run and hand back whatever it returns.
    pub async fn modify<R, F>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Run) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let applied = self
            .update(
                id,
                Box::new(move |run: &mut Run| {
                    let _ = tx.send(f(run));
                }),
            )
            .await;
        if !applied {
            return None;
        }
        rx.await.ok()
    }
}

const EVENT_CAPACITY: usize = 256;

struct RunEntry {
    run: RwLock<Run>,
    status: watch::Sender<RunStatus>,
    events: broadcast::Sender<RunEvent>,
}

/// Process-local store: one lock for the id map, one lock per run.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, Arc<RunEntry>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: &str) -> Option<Arc<RunEntry>> {
        self.runs.read().await.get(id).cloned()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert(&self, run: Run) {
        let (status, _) = watch::channel(run.status);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let id = run.id.clone();
        let entry = Arc::new(RunEntry {
            run: RwLock::new(run),
            status,
            events,
        });
        self.runs.write().await.insert(id, entry);
    }

    async fn get(&self, id: &str) -> Option<Run> {
        let entry = self.entry(id).await?;
        let run = entry.run.read().await;
        Some(run.clone())
    }

    async fn update(&self, id: &str, mutation: Mutation) -> bool {
        let Some(entry) = self.entry(id).await else {
            return false;
        };

        let mut run = entry.run.write().await;
        let status_before = run.status;
        let steps_before: Vec<StepStatus> = run.steps.iter().map(|s| s.status).collect();
        let seq_before = run.log_seq;

        mutation(&mut *run);

        let mut events = Vec::new();
        if run.status != status_before {
            events.push(RunEvent::Status { status: run.status });
        }
        for (step, before) in run.steps.iter().zip(steps_before) {
            if step.status != before {
                events.push(RunEvent::Step {
                    step_id: step.id.clone(),
                    status: step.status,
                    detail: step.error.clone().or_else(|| step.result.clone()),
                });
            }
        }
        let appended = (run.log_seq - seq_before) as usize;
        for line in run.log_tail(appended.min(run.logs.len())) {
            events.push(RunEvent::Log { line });
        }

        let status = run.status;
        drop(run);

        entry.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        for event in events {
            // No subscribers is fine.
            let _ = entry.events.send(event);
        }
        true
    }

    async fn list(&self) -> Vec<RunSummary> {
        let entries: Vec<Arc<RunEntry>> = self.runs.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            summaries.push(entry.run.read().await.summary());
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    async fn watch_status(&self, id: &str) -> Option<watch::Receiver<RunStatus>> {
        Some(self.entry(id).await?.status.subscribe())
    }

    async fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<RunEvent>> {
        Some(self.entry(id).await?.events.subscribe())
    }
}
