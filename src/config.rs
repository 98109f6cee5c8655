//! Runtime settings for the browser, the executor and the HTTP surface.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::{DEFAULT_MAX_STEPS, MIN_LOG_TAIL};

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    /// Chrome/Chromium binary. Auto-detected when `None`.
    pub chrome_path: Option<PathBuf>,
    pub snapshot_dir: PathBuf,
    pub window_size: (u32, u32),
    pub navigate_timeout: Duration,
    pub element_timeout: Duration,
    pub visible_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            snapshot_dir: default_snapshot_dir(),
            window_size: (1280, 900),
            navigate_timeout: Duration::from_secs(30),
            element_timeout: Duration::from_secs(10),
            visible_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Pause between consecutive steps.
    pub step_delay: Duration,
    /// How often a paused run re-checks its status without a notification.
    pub pause_poll: Duration,
    pub max_steps: usize,
    /// Longest `wait` step the executor will perform.
    pub max_wait: Duration,
    /// Wall-clock ceiling for one run. Unlimited when `None`.
    pub run_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(300),
            pause_poll: Duration::from_millis(500),
            max_steps: DEFAULT_MAX_STEPS,
            max_wait: Duration::from_secs(60),
            run_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind: String,
    /// Number of log lines returned by a status read.
    pub log_tail: usize,
    pub browser: BrowserConfig,
    pub executor: ExecutorConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            log_tail: MIN_LOG_TAIL,
            browser: BrowserConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

fn default_snapshot_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("agentic-rpa").join("snapshots"))
        .unwrap_or_else(|| PathBuf::from("snapshots"))
}
