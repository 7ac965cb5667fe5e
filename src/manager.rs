//! Render engine manager
//!
//! Owns at most one browser engine, launched on first use, and runs render
//! jobs against it one at a time. The mutex guarding the engine slot is the
//! serialization token: every engine interaction (render steps, kept-page
//! calls, launch and shutdown) happens while holding it.

use crate::engine::{default_launcher, BrowserEngine, BrowserPage, EngineLauncher, LoadEvent};
use crate::{BrowserConfig, CookieParam, Error, Result, ScriptResult};
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Lifecycle of the managed engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unstarted,
    Starting,
    Ready,
    Rendering,
    Closed,
}

/// What a render loads into the page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderContent {
    /// Markup loaded as the page content
    Markup(String),
    /// A live URL to navigate to
    Url(String),
}

/// One render request
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub content: RenderContent,
    /// Lifecycle point to wait for once the content is loaded
    pub wait_until: Option<LoadEvent>,
    pub script: Option<String>,
    pub wait: Duration,
    pub scroll_down: u32,
    pub sleep: Duration,
    pub timeout: Duration,
    pub cookies: Vec<CookieParam>,
    pub keep_page: bool,
}

impl RenderJob {
    /// A job with no script, no settle period and an 8 second deadline
    pub fn new(content: RenderContent) -> Self {
        Self {
            content,
            wait_until: None,
            script: None,
            wait: Duration::ZERO,
            scroll_down: 0,
            sleep: Duration::ZERO,
            timeout: Duration::from_secs(8),
            cookies: Vec::new(),
            keep_page: false,
        }
    }
}

/// Result of a successful render
#[derive(Debug)]
pub struct RenderOutput {
    /// Serialized DOM after the settle period
    pub html: String,
    /// What the job's script returned, if it had one
    pub script_result: Option<ScriptResult>,
    /// The page, when the job asked to keep it
    pub page: Option<KeptPage>,
}

struct Slot {
    engine: Option<Box<dyn BrowserEngine>>,
    /// The last render overran or failed mid-flight; relaunch before reuse
    suspect: bool,
    closed: bool,
    kept: HashMap<u64, Box<dyn BrowserPage>>,
    next_page_id: u64,
}

struct Inner {
    launcher: Arc<dyn EngineLauncher>,
    config: BrowserConfig,
    slot: Mutex<Slot>,
    state: Mutex<EngineState>,
}

/// Handle to a lazily launched, serialized browser engine.
///
/// Clones share the same engine. The engine is launched on the first render
/// and terminated by [`close`](Self::close); dropping the last handle closes
/// it as well.
#[derive(Clone)]
pub struct RenderEngineManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for RenderEngineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderEngineManager")
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Time left before `deadline`, or a timeout error once it has passed
fn remaining(deadline: Instant, budget: Duration) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(Error::RenderTimeout(budget.as_millis() as u64))
    } else {
        Ok(left)
    }
}

/// Sleep for `period`, failing if that would cross the deadline
fn settle(period: Duration, deadline: Instant, budget: Duration) -> Result<()> {
    if period.is_zero() {
        return Ok(());
    }
    let left = remaining(deadline, budget)?;
    if period >= left {
        thread::sleep(left);
        return Err(Error::RenderTimeout(budget.as_millis() as u64));
    }
    thread::sleep(period);
    Ok(())
}

/// Run one engine step and convert overruns into timeouts, whether the step
/// itself failed or merely returned late.
fn step<T>(
    deadline: Instant,
    budget: Duration,
    f: impl FnOnce(Duration) -> Result<T>,
) -> Result<T> {
    let left = remaining(deadline, budget)?;
    let out = f(left);
    if Instant::now() >= deadline {
        return Err(Error::RenderTimeout(budget.as_millis() as u64));
    }
    out
}

fn run_steps(
    page: &mut dyn BrowserPage,
    job: &RenderJob,
    deadline: Instant,
) -> Result<(String, Option<ScriptResult>)> {
    let budget = job.timeout;

    match &job.content {
        RenderContent::Url(url) => step(deadline, budget, |t| page.goto(url, t))?,
        RenderContent::Markup(markup) => step(deadline, budget, |t| page.set_content(markup, t))?,
    }

    if let Some(event) = job.wait_until {
        step(deadline, budget, |t| page.wait_for_load(event, t))?;
    }

    let script_result = match &job.script {
        Some(script) => Some(step(deadline, budget, |t| page.evaluate(script, t))?),
        None => None,
    };

    settle(job.wait, deadline, budget)?;

    for _ in 0..job.scroll_down {
        step(deadline, budget, |t| page.scroll_to_bottom(t))?;
        settle(job.sleep, deadline, budget)?;
    }

    let html = step(deadline, budget, |t| page.content(t))?;
    Ok((html, script_result))
}

type StepOutcome = (Box<dyn BrowserPage>, Result<(String, Option<ScriptResult>)>);

/// Drive the page through the job's steps on a worker thread. The page comes
/// back with the outcome; when the caller has stopped listening the worker
/// closes it instead.
fn spawn_steps(
    page: Box<dyn BrowserPage>,
    job: RenderJob,
    user_agent: Option<String>,
    deadline: Instant,
) -> Result<mpsc::Receiver<StepOutcome>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("rfhtml-render".into())
        .spawn(move || {
            let mut page = page;
            if let Some(ua) = &user_agent {
                if let Err(e) = page.set_user_agent(ua) {
                    warn!("Failed to set user agent on render page: {}", e);
                }
            }
            if !job.cookies.is_empty() {
                if let Err(e) = page.set_cookies(job.cookies.clone()) {
                    warn!("Failed to set cookies on render page: {}", e);
                }
            }

            let result = run_steps(page.as_mut(), &job, deadline);
            if let Err(mpsc::SendError((mut page, _))) = tx.send((page, result)) {
                debug!("abandoned render page finished after its deadline");
                if let Err(e) = page.close() {
                    warn!("Failed to close abandoned render page: {}", e);
                }
            }
        })
        .map_err(|e| Error::Render(format!("Failed to spawn render worker: {}", e)))?;
    Ok(rx)
}

impl RenderEngineManager {
    /// Manager for the compiled-in browser backend
    pub fn new(config: BrowserConfig) -> Self {
        Self::with_launcher(config, default_launcher())
    }

    /// Manager over a custom engine launcher
    pub fn with_launcher(config: BrowserConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                config,
                slot: Mutex::new(Slot {
                    engine: None,
                    suspect: false,
                    closed: false,
                    kept: HashMap::new(),
                    next_page_id: 1,
                }),
                state: Mutex::new(EngineState::Unstarted),
            }),
        }
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.inner.config
    }

    /// Current lifecycle state; never blocks behind a running render
    pub fn state(&self) -> EngineState {
        *lock(&self.inner.state)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == EngineState::Closed
    }

    fn set_state(&self, state: EngineState) {
        *lock(&self.inner.state) = state;
    }

    /// Whether both handles share one engine
    pub fn same_engine(&self, other: &RenderEngineManager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Launch the engine if it is not running yet
    pub fn ensure_started(&self) -> Result<()> {
        let mut slot = lock(&self.inner.slot);
        self.ensure_started_locked(&mut slot)
    }

    fn ensure_started_locked(&self, slot: &mut Slot) -> Result<()> {
        if slot.closed {
            return Err(Error::EngineClosed);
        }
        if slot.suspect {
            debug!("restarting render engine after a failed render");
            self.shutdown_locked(slot);
            slot.suspect = false;
        }
        if slot.engine.is_some() {
            return Ok(());
        }

        self.set_state(EngineState::Starting);
        match self.inner.launcher.launch(&self.inner.config) {
            Ok(engine) => {
                debug!("render engine launched");
                slot.engine = Some(engine);
                self.set_state(EngineState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(EngineState::Unstarted);
                Err(match e {
                    Error::EngineLaunch(_) => e,
                    other => Error::EngineLaunch(other.to_string()),
                })
            }
        }
    }

    /// Close kept pages and the engine; leaves the slot reusable
    fn shutdown_locked(&self, slot: &mut Slot) {
        for (id, mut page) in slot.kept.drain() {
            if let Err(e) = page.close() {
                warn!("Failed to close kept page {}: {}", id, e);
            }
        }
        if let Some(mut engine) = slot.engine.take() {
            if let Err(e) = engine.close() {
                warn!("Failed to close render engine: {}", e);
            }
        }
    }

    /// Render one job: load the content, run the script, let the page settle,
    /// scroll and serialize the DOM.
    ///
    /// Blocks while another render holds the engine. The deadline covers the
    /// engine steps only. The steps run on a worker thread, so a wedged page
    /// cannot hold the caller past the deadline: the render fails with
    /// [`Error::RenderTimeout`], the page is abandoned and the engine is
    /// replaced before next use.
    pub fn render(&self, job: RenderJob) -> Result<RenderOutput> {
        let mut slot = lock(&self.inner.slot);
        self.ensure_started_locked(&mut slot)?;

        let deadline = Instant::now() + job.timeout;
        self.set_state(EngineState::Rendering);
        let result = self.render_locked(&mut slot, job, deadline);
        self.set_state(EngineState::Ready);

        match result {
            Ok((page, html, script_result)) => {
                let page = match page {
                    Some(page) => {
                        let id = slot.next_page_id;
                        slot.next_page_id += 1;
                        slot.kept.insert(id, page);
                        Some(KeptPage { manager: self.clone(), id })
                    }
                    None => None,
                };
                Ok(RenderOutput { html, script_result, page })
            }
            Err(e) => {
                if matches!(e, Error::RenderTimeout(_) | Error::Render(_)) {
                    debug!("render failed ({}); engine marked for restart", e);
                    slot.suspect = true;
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn render_locked(
        &self,
        slot: &mut Slot,
        job: RenderJob,
        deadline: Instant,
    ) -> Result<(Option<Box<dyn BrowserPage>>, String, Option<ScriptResult>)> {
        let engine = slot.engine.as_mut().ok_or(Error::EngineClosed)?;
        let page = engine.new_page()?;
        let budget = job.timeout;
        let keep_page = job.keep_page;

        let rx = spawn_steps(page, job, self.inner.config.user_agent.clone(), deadline)?;
        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok((mut page, Ok((html, script_result)))) => {
                if keep_page {
                    return Ok((Some(page), html, script_result));
                }
                if let Err(e) = page.close() {
                    warn!("Failed to close render page: {}", e);
                }
                Ok((None, html, script_result))
            }
            Ok((mut page, Err(e))) => {
                // a page that overran may be wedged; the engine restart reaps it
                if !matches!(e, Error::RenderTimeout(_)) {
                    if let Err(close_err) = page.close() {
                        warn!("Failed to close render page: {}", close_err);
                    }
                }
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("render page unresponsive after {}ms; abandoning it", budget.as_millis());
                Err(Error::RenderTimeout(budget.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Render("render worker exited without a result".into()))
            }
        }
    }

    /// Async variant of [`render`](Self::render); the engine steps run on
    /// tokio's blocking pool
    pub async fn render_async(&self, job: RenderJob) -> Result<RenderOutput> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.render(job))
            .await
            .map_err(|e| Error::Other(format!("render task failed: {}", e)))?
    }

    fn with_kept_page<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut dyn BrowserPage) -> Result<T>,
    ) -> Result<T> {
        let mut slot = lock(&self.inner.slot);
        if slot.closed {
            return Err(Error::EngineClosed);
        }
        let page = slot.kept.get_mut(&id).ok_or(Error::EngineClosed)?;
        f(page.as_mut())
    }

    fn release_page(&self, id: u64) -> Result<()> {
        let mut slot = lock(&self.inner.slot);
        match slot.kept.remove(&id) {
            Some(mut page) => page.close(),
            None => Ok(()),
        }
    }

    /// Number of pages currently kept open
    pub fn kept_pages(&self) -> usize {
        lock(&self.inner.slot).kept.len()
    }

    /// Terminate the engine and any kept pages. Idempotent; safe on a
    /// manager that never launched.
    pub fn close(&self) -> Result<()> {
        let mut slot = lock(&self.inner.slot);
        if slot.closed {
            return Ok(());
        }
        self.shutdown_locked(&mut slot);
        slot.closed = true;
        self.set_state(EngineState::Closed);
        debug!("render engine manager closed");
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(|p| p.into_inner());
        if slot.closed {
            return;
        }
        for (id, mut page) in slot.kept.drain() {
            if let Err(e) = page.close() {
                warn!("Failed to close kept page {}: {}", id, e);
            }
        }
        if let Some(mut engine) = slot.engine.take() {
            debug!("render engine dropped without close()");
            if let Err(e) = engine.close() {
                warn!("Failed to close render engine: {}", e);
            }
        }
        slot.closed = true;
    }
}

/// A page kept open after a render (`keep_page`).
///
/// Calls go through the owning manager, so they queue behind renders.
pub struct KeptPage {
    manager: RenderEngineManager,
    id: u64,
}

impl fmt::Debug for KeptPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeptPage").field("id", &self.id).finish()
    }
}

impl KeptPage {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn evaluate(&self, script: &str, timeout: Duration) -> Result<ScriptResult> {
        self.manager.with_kept_page(self.id, |page| page.evaluate(script, timeout))
    }

    /// Serialize the page's current DOM
    pub fn content(&self, timeout: Duration) -> Result<String> {
        self.manager.with_kept_page(self.id, |page| page.content(timeout))
    }

    pub fn close(self) -> Result<()> {
        self.manager.release_page(self.id)
    }
}
