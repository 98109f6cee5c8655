//! Session manager: one isolated Chrome instance per session.
//!
//! headless_chrome is a blocking API, so every browser call runs on the
//! blocking pool and is additionally bounded on the async side.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::address;
use crate::config::BrowserConfig;
use crate::dom;
use crate::error::SessionError;
use crate::types::{Action, SelectorEngine};

/// Where a session is after an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Name of the most recent snapshot file, if any was taken yet.
    #[serde(rename = "snapshotRef")]
    pub snapshot: Option<String>,
    #[serde(rename = "currentLocation")]
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedSession {
    pub session_id: String,
    #[serde(flatten)]
    pub frame: Frame,
}

/// A failed step, with the snapshot taken after the failure when possible.
#[derive(Debug)]
pub struct StepFailure {
    pub error: SessionError,
    pub frame: Option<Frame>,
}

impl From<SessionError> for StepFailure {
    fn from(error: SessionError) -> Self {
        Self { error, frame: None }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

/// The four-operation session protocol the executor drives.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Launch a new isolated browsing context, optionally navigate, and take
    /// the first snapshot.
    async fn open(&self, location: Option<&str>) -> Result<OpenedSession, SessionError>;

    /// Perform one browser action.
    async fn step(&self, session_id: &str, action: &Action) -> Result<Frame, StepFailure>;

    async fn screenshot(&self, session_id: &str) -> Result<Frame, SessionError>;

    /// Tear the session down. Returns false if there was nothing to close.
    async fn close(&self, session_id: &str) -> bool;
}

/// Extra time the async side waits beyond the browser-side timeout.
const BLOCKING_GRACE: Duration = Duration::from_secs(5);
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(600);

struct ChromeSession {
    id: String,
    // Dropping the browser kills the Chrome process.
    _browser: Browser,
    tab: Arc<Tab>,
    snapshots: AtomicU64,
}

impl ChromeSession {
    fn last_snapshot(&self) -> Option<String> {
        match self.snapshots.load(Ordering::SeqCst) {
            0 => None,
            n => Some(snapshot_name(&self.id, n)),
        }
    }

    fn capture(&self, dir: &Path) -> Result<Frame, SessionError> {
        let png = self
            .tab
            .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
            .map_err(|e| SessionError::ScreenshotFailed(e.to_string()))?;
        let n = self.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
        let name = snapshot_name(&self.id, n);
        std::fs::write(dir.join(&name), png)?;
        Ok(Frame {
            snapshot: Some(name),
            location: self.tab.get_url(),
        })
    }

    fn frame(&self) -> Frame {
        Frame {
            snapshot: self.last_snapshot(),
            location: self.tab.get_url(),
        }
    }
}

pub fn snapshot_name(session_id: &str, n: u64) -> String {
    format!("{session_id}-{n}.png")
}

/// Chrome-backed sessions, keyed by session id.
pub struct ChromeSessions {
    config: BrowserConfig,
    sessions: RwLock<HashMap<String, Arc<ChromeSession>>>,
}

impl ChromeSessions {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.config.snapshot_dir
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every open session.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.close(&id).await;
        }
        info!("all browser sessions closed");
    }

    async fn session(&self, session_id: &str) -> Result<Arc<ChromeSession>, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))
    }

    fn action_timeout(&self, action: &Action) -> Duration {
        match action {
            Action::Navigate { .. } => self.config.navigate_timeout,
            Action::WaitForElement { .. } => self.config.visible_timeout,
            _ => self.config.element_timeout,
        }
    }
}

#[async_trait]
impl SessionBackend for ChromeSessions {
    async fn open(&self, location: Option<&str>) -> Result<OpenedSession, SessionError> {
        let location = location.map(address::normalize).transpose().map_err(|e| {
            SessionError::InvalidArguments(format!("initial location: {e}"))
        })?;

        tokio::fs::create_dir_all(&self.config.snapshot_dir).await?;

        let session_id = format!("sess-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let config = self.config.clone();
        let id = session_id.clone();

        let limit = LAUNCH_TIMEOUT + config.navigate_timeout;
        let (session, frame) = blocking("open", limit, move || {
            let session = launch(&id, &config)?;
            if let Some(url) = location.as_deref() {
                navigate(&session.tab, url, config.navigate_timeout)?;
            }
            let frame = session.capture(&config.snapshot_dir)?;
            Ok((session, frame))
        })
        .await?;

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::new(session));
        info!(session_id = %session_id, location = %frame.location, "browser session opened");

        Ok(OpenedSession { session_id, frame })
    }

    async fn step(&self, session_id: &str, action: &Action) -> Result<Frame, StepFailure> {
        let session = self.session(session_id).await?;
        debug!(session_id, action = action.name(), "browser step");

        match action {
            Action::Wait { ms } => {
                // Closing during the wait must be able to drop the browser.
                drop(session);
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                return Ok(self.session(session_id).await?.frame());
            }
            Action::Screenshot => {
                return self.screenshot(session_id).await.map_err(StepFailure::from);
            }
            action if action.is_diagnostic() => {
                return Err(SessionError::UnknownAction(action.name().to_string()).into());
            }
            _ => {}
        }

        let timeout = self.action_timeout(action);
        let dir = self.config.snapshot_dir.clone();
        let action = action.clone();
        let (outcome, frame) = blocking("step", timeout + BLOCKING_GRACE, move || {
            let outcome = perform(&session.tab, &action, timeout);
            let frame = session.capture(&dir);
            Ok((outcome, frame))
        })
        .await?;

        match outcome {
            Ok(()) => frame.map_err(StepFailure::from),
            Err(error) => {
                warn!(session_id, error = %error, "browser step failed");
                Err(StepFailure {
                    error,
                    frame: frame.ok(),
                })
            }
        }
    }

    async fn screenshot(&self, session_id: &str) -> Result<Frame, SessionError> {
        let session = self.session(session_id).await?;
        let dir = self.config.snapshot_dir.clone();
        blocking(
            "screenshot",
            self.config.element_timeout + BLOCKING_GRACE,
            move || session.capture(&dir),
        )
        .await
    }

    async fn close(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions.write().await.remove(session_id) else {
            debug!(session_id, "close requested for unknown session");
            return false;
        };

        let closed = tokio::task::spawn_blocking(move || {
            if let Err(e) = session.tab.close(true) {
                debug!(session_id = %session.id, error = %e, "tab close failed");
            }
        })
        .await;
        if let Err(e) = closed {
            warn!(session_id, error = %e, "browser teardown task failed");
        }
        info!(session_id, "browser session closed");
        true
    }
}

fn launch(session_id: &str, config: &BrowserConfig) -> Result<ChromeSession, SessionError> {
    let options = LaunchOptions {
        headless: config.headless,
        path: config.chrome_path.clone(),
        window_size: Some(config.window_size),
        idle_browser_timeout: IDLE_BROWSER_TIMEOUT,
        args: vec![
            std::ffi::OsStr::new("--no-first-run"),
            std::ffi::OsStr::new("--no-default-browser-check"),
            std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
        ],
        ..Default::default()
    };

    let browser = Browser::new(options).map_err(|e| SessionError::LaunchFailed(e.to_string()))?;
    let tab = browser
        .new_tab()
        .map_err(|e| SessionError::LaunchFailed(format!("could not open tab: {e}")))?;
    tab.set_default_timeout(config.navigate_timeout);

    Ok(ChromeSession {
        id: session_id.to_string(),
        _browser: browser,
        tab,
        snapshots: AtomicU64::new(0),
    })
}

fn navigate(tab: &Arc<Tab>, url: &str, timeout: Duration) -> Result<(), SessionError> {
    let deadline = Instant::now() + timeout;
    tab.navigate_to(url)
        .map_err(|e| SessionError::NavigationFailed(format!("{url}: {e}")))?;
    tab.wait_until_navigated()
        .map_err(|e| SessionError::NavigationFailed(format!("{url}: {e}")))?;
    if !dom::wait_interactive(tab, deadline)? {
        return Err(SessionError::Timeout {
            what: format!("{url} to become interactive"),
            ms: timeout.as_millis() as u64,
        });
    }
    Ok(())
}

fn perform(tab: &Arc<Tab>, action: &Action, timeout: Duration) -> Result<(), SessionError> {
    match action {
        Action::Navigate { url } => {
            let url = address::normalize(url)
                .map_err(|e| SessionError::InvalidArguments(e.to_string()))?;
            navigate(tab, &url, timeout)
        }
        Action::Click { selector, engine } => {
            let element = locate(tab, selector, *engine, timeout)?;
            element.click()?;
            Ok(())
        }
        Action::Type {
            selector,
            engine,
            text,
        } => {
            let element = locate(tab, selector, *engine, timeout)?;
            dom::replace_value(&element, text)?;
            Ok(())
        }
        Action::WaitForElement { selector, engine } => {
            let deadline = Instant::now() + timeout;
            let element = locate(tab, selector, *engine, timeout)?;
            if !dom::wait_visible(&element, deadline)? {
                return Err(SessionError::Timeout {
                    what: format!("{selector} to become visible"),
                    ms: timeout.as_millis() as u64,
                });
            }
            Ok(())
        }
        other => Err(SessionError::UnknownAction(other.name().to_string())),
    }
}

fn locate<'a>(
    tab: &'a Arc<Tab>,
    selector: &str,
    engine: SelectorEngine,
    timeout: Duration,
) -> Result<headless_chrome::Element<'a>, SessionError> {
    if selector.trim().is_empty() {
        return Err(SessionError::InvalidArguments("empty selector".to_string()));
    }
    dom::find_element(tab, selector, engine, timeout)
        .map_err(|e| SessionError::ElementNotFound(format!("{selector}: {e}")))
}

/// Run `f` on the blocking pool, giving up after `limit`.
async fn blocking<T, F>(what: &str, limit: Duration, f: F) -> Result<T, SessionError>
where
    F: FnOnce() -> Result<T, SessionError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(SessionError::Other(anyhow::anyhow!("{what} task failed: {e}"))),
        Err(_) => Err(SessionError::Timeout {
            what: what.to_string(),
            ms: limit.as_millis() as u64,
        }),
    }
}
