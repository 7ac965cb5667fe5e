//! Browser-engine seam.
//!
//! The render manager drives a browser through three small traits: a
//! launcher that starts an engine process, the engine itself (which hands
//! out pages) and a page that can load content, run scripts and serialize
//! its DOM. The headless Chrome adapter lives in `cdp`; tests plug in
//! scripted stand-ins.

use crate::{BrowserConfig, CookieParam, Error, Result, ScriptResult};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Scrolls the viewport to the bottom of the document
pub const SCROLL_TO_BOTTOM_JS: &str =
    "window.scrollTo(0, document.body ? document.body.scrollHeight : 0)";

/// Page lifecycle point a render waits for after loading its content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadEvent {
    /// The `load` event has fired
    Load,
    /// The DOM is parsed (`DOMContentLoaded`)
    DomContentLoaded,
    /// The page has fetched no new resources for 500ms after `load`
    NetworkIdle,
}

impl LoadEvent {
    /// Script that resolves once the page reaches this point
    pub fn script(self) -> &'static str {
        match self {
            LoadEvent::Load => {
                "() => new Promise(function (resolve) {
                    if (document.readyState === 'complete') { resolve(true); return; }
                    window.addEventListener('load', function () { resolve(true); });
                })"
            }
            LoadEvent::DomContentLoaded => {
                "() => new Promise(function (resolve) {
                    if (document.readyState !== 'loading') { resolve(true); return; }
                    document.addEventListener('DOMContentLoaded', function () { resolve(true); });
                })"
            }
            LoadEvent::NetworkIdle => {
                "() => new Promise(function (resolve) {
                    var seen = -1, since = Date.now();
                    (function poll() {
                        var n = performance.getEntriesByType('resource').length;
                        if (n !== seen) { seen = n; since = Date.now(); }
                        if (document.readyState === 'complete' && Date.now() - since >= 500) { resolve(true); return; }
                        setTimeout(poll, 50);
                    })();
                })"
            }
        }
    }
}

impl fmt::Display for LoadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadEvent::Load => "load",
            LoadEvent::DomContentLoaded => "domcontentloaded",
            LoadEvent::NetworkIdle => "networkidle",
        })
    }
}

impl FromStr for LoadEvent {
    type Err = Error;

    /// Accepts the puppeteer names, including `networkidle0`/`networkidle2`
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "load" => Ok(LoadEvent::Load),
            "domcontentloaded" => Ok(LoadEvent::DomContentLoaded),
            "networkidle" | "networkidle0" | "networkidle2" => Ok(LoadEvent::NetworkIdle),
            other => Err(Error::Config(format!("unknown load event {:?}", other))),
        }
    }
}

/// Starts browser-engine processes
pub trait EngineLauncher: Send + Sync {
    /// Launch a new engine. Failing to start is reported as
    /// [`Error::EngineLaunch`].
    fn launch(&self, config: &BrowserConfig) -> Result<Box<dyn BrowserEngine>>;
}

/// A running browser-engine process
pub trait BrowserEngine: Send {
    /// Open a fresh page (tab)
    fn new_page(&mut self) -> Result<Box<dyn BrowserPage>>;

    /// Terminate the engine process. Must be safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

/// One page of a running engine.
///
/// Every blocking call receives the time left before the render deadline and
/// should give up once it is spent.
pub trait BrowserPage: Send {
    /// Navigate to a live URL and wait for the load to finish
    fn goto(&mut self, url: &str, timeout: Duration) -> Result<()>;

    /// Load a markup string as the page content
    fn set_content(&mut self, markup: &str, timeout: Duration) -> Result<()>;

    /// Evaluate a script in the page. A script that throws produces a
    /// `ScriptResult` with `is_error` set; `Err` means the script could not
    /// be run at all.
    fn evaluate(&mut self, script: &str, timeout: Duration) -> Result<ScriptResult>;

    /// Serialize the current DOM
    fn content(&mut self, timeout: Duration) -> Result<String>;

    fn set_user_agent(&mut self, user_agent: &str) -> Result<()>;

    fn set_cookies(&mut self, cookies: Vec<CookieParam>) -> Result<()>;

    fn scroll_to_bottom(&mut self, timeout: Duration) -> Result<()> {
        self.evaluate(SCROLL_TO_BOTTOM_JS, timeout).map(|_| ())
    }

    /// Block until the loaded page reaches `event`
    fn wait_for_load(&mut self, event: LoadEvent, timeout: Duration) -> Result<()> {
        let result = self.evaluate(event.script(), timeout)?;
        if result.is_error {
            return Err(Error::Render(format!("waiting for {} failed: {}", event, result.value)));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()>;
}

/// Whether a script looks like a function to be invoked (`function () {..}`,
/// `async () => ..`, `x => ..`) rather than an expression to evaluate.
pub fn is_function_script(script: &str) -> bool {
    static FUNCTION_SHAPE: OnceLock<Option<Regex>> = OnceLock::new();
    FUNCTION_SHAPE
        .get_or_init(|| {
            Regex::new(r"^(?:async\s+)?(?:function\b|\([^()]*\)\s*=>|[A-Za-z_$][\w$]*\s*=>)").ok()
        })
        .as_ref()
        .map_or(false, |re| re.is_match(script.trim_start()))
}

/// Launcher used when no browser backend is compiled in
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackend;

impl EngineLauncher for NoBackend {
    fn launch(&self, _config: &BrowserConfig) -> Result<Box<dyn BrowserEngine>> {
        Err(Error::EngineLaunch(
            "no browser backend available; build with the `cdp` feature".into(),
        ))
    }
}

/// The launcher for the compiled-in backend (headless Chrome with `cdp`)
pub fn default_launcher() -> Arc<dyn EngineLauncher> {
    #[cfg(feature = "cdp")]
    {
        Arc::new(crate::cdp::ChromeLauncher)
    }
    #[cfg(not(feature = "cdp"))]
    {
        Arc::new(NoBackend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_shaped_scripts() {
        assert!(is_function_script("() => document.title"));
        assert!(is_function_script("  async () => { await x(); }"));
        assert!(is_function_script("function () { return 1 }"));
        assert!(is_function_script("async function run() {}"));
        assert!(is_function_script("el => el.textContent"));
        assert!(is_function_script("(a, b) => a + b"));
    }

    #[test]
    fn expression_scripts() {
        assert!(!is_function_script("document.title"));
        assert!(!is_function_script("(function(){ return 1 })()"));
        assert!(!is_function_script("functionName()"));
        assert!(!is_function_script("1 + 1"));
    }

    #[test]
    fn load_event_names() {
        assert_eq!("load".parse::<LoadEvent>().unwrap(), LoadEvent::Load);
        assert_eq!("DOMContentLoaded".parse::<LoadEvent>().unwrap(), LoadEvent::DomContentLoaded);
        assert_eq!("networkidle0".parse::<LoadEvent>().unwrap(), LoadEvent::NetworkIdle);
        assert_eq!("networkidle2".parse::<LoadEvent>().unwrap(), LoadEvent::NetworkIdle);
        assert!(matches!("idle".parse::<LoadEvent>(), Err(Error::Config(_))));
        assert_eq!(LoadEvent::DomContentLoaded.to_string(), "domcontentloaded");
    }

    #[test]
    fn load_event_scripts_are_functions() {
        for event in [LoadEvent::Load, LoadEvent::DomContentLoaded, LoadEvent::NetworkIdle] {
            assert!(is_function_script(event.script()), "{}", event);
        }
    }

    #[test]
    fn no_backend_fails_to_launch() {
        let err = NoBackend.launch(&BrowserConfig::default()).err();
        assert!(matches!(err, Some(Error::EngineLaunch(_))));
    }
}
