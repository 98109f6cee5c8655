//! Agentic RPA -- turns natural-language instructions into browser runs.
//!
//! An instruction is parsed into steps ([`brain`]), registered as a run
//! ([`registry`]), and executed against a Chrome session ([`hands`]) by the
//! run loop ([`executor`]). Callers drive and observe runs through
//! [`control`], exposed over HTTP by [`face`].

pub mod address;
pub mod brain;
pub mod config;
pub mod control;
pub mod dom;
pub mod error;
pub mod executor;
pub mod face;
pub mod hands;
pub mod registry;
pub mod types;

use std::sync::Arc;

use anyhow::Result;

use crate::brain::HeuristicParser;
use crate::config::AgentConfig;
use crate::control::RunControl;
use crate::executor::RunExecutor;
use crate::hands::ChromeSessions;
use crate::registry::MemoryRunStore;

/// Wire the default parser, an in-memory registry and Chrome sessions.
pub fn build(config: &AgentConfig) -> (RunControl, Arc<ChromeSessions>) {
    let sessions = Arc::new(ChromeSessions::new(config.browser.clone()));
    let executor = RunExecutor::new(
        Arc::new(MemoryRunStore::new()),
        sessions.clone(),
        config.executor.clone(),
    );
    let control = RunControl::new(Arc::new(HeuristicParser), executor, config.log_tail);
    (control, sessions)
}

/// Serve the HTTP surface until Ctrl-C, then close every browser session.
pub async fn serve(config: AgentConfig) -> Result<()> {
    let (control, sessions) = build(&config);
    tokio::fs::create_dir_all(sessions.snapshot_dir()).await?;

    let app = face::router(face::AppState {
        control,
        snapshot_dir: sessions.snapshot_dir().to_path_buf(),
    });

    let listener = face::bind(&config.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "agent listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "could not listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("shutting down");
    sessions.shutdown().await;
    Ok(())
}
