//! rfhtml: fetch, render and query HTML
//!
//! A session fetches pages over HTTP and wraps them in [`Document`]s that can
//! be queried with CSS selectors, XPath expressions or text templates. A
//! document can also be rendered: its markup is loaded into a headless
//! browser, scripts run, and the resulting DOM replaces the static parse for
//! subsequent queries.
//!
//! # Features
//!
//! - **CDP Backend** (default): renders through headless Chrome via the
//!   DevTools protocol
//! - **Engine seam**: the render manager only talks to the [`engine`] traits,
//!   so backends can be swapped (tests use scripted stand-ins)
//! - **Safe Defaults**: TLS verification on, one engine per session, renders
//!   serialized and bounded by a deadline
//!
//! # Example
//!
//! ```no_run
//! use rfhtml::{RenderOptions, Session};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new()?;
//! let mut doc = session.get("https://example.com")?;
//! let before = doc.find("a")?.len();
//! doc.render(&RenderOptions::default())?;
//! println!("{} links before render, {} after", before, doc.find("a")?.len());
//! for link in doc.absolute_links() {
//!     println!("{}", link);
//! }
//! session.close()?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod element;
pub mod engine;
pub mod links;
pub mod manager;
pub mod template;
pub mod tree;
pub mod xpath;

#[cfg(feature = "cdp")]
pub mod cdp;

pub mod document;
pub mod session;

// Async calling convention over the same documents and render manager
pub mod async_api;

pub use async_api::AsyncSession;
pub use document::Document;
pub use engine::LoadEvent;
pub use element::{AttrValue, Attrs, Element, FindOptions, Selection, XPathItem};
pub use links::resolve;
pub use manager::{EngineState, KeptPage, RenderEngineManager};
pub use session::{Method, RequestOptions, Response, Session};
pub use template::{Captures, Template};
pub use tree::DocumentTree;

/// Desktop Safari user agent sent when `mock_browser` is on
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_12_6) AppleWebKit/603.3.8 (KHTML, like Gecko) Version/10.1.2 Safari/603.3.8";

/// Session-wide configuration: transport settings, render defaults and the
/// browser launch options.
///
/// ```
/// let cfg = rfhtml::SessionConfig::default();
/// assert!(cfg.mock_browser);
/// assert!(cfg.user_agent.contains("Safari"));
/// assert_eq!(cfg.timeout_ms, 30000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// User agent string sent with requests and set on render pages
    pub user_agent: String,
    /// Whether to send `user_agent` at all
    pub mock_browser: bool,
    /// Extra request headers
    pub headers: HashMap<String, String>,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
    pub follow_redirects: bool,
    pub verify_tls: bool,
    /// Encoding label used when a response declares none and its markup
    /// carries no hint
    pub default_encoding: String,
    /// Launch options for the session's render engine
    pub browser: BrowserConfig,
    /// Maximum concurrent fetches for [`AsyncSession`] (default: 5 per CPU)
    pub workers: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            mock_browser: true,
            headers: HashMap::new(),
            timeout_ms: 30000,
            follow_redirects: true,
            verify_tls: true,
            default_encoding: "utf-8".to_string(),
            browser: BrowserConfig::default(),
            workers: None,
        }
    }
}

impl SessionConfig {
    /// Concurrency bound for async fetches
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| num_cpus::get() * 5).max(1)
    }

    /// Browser options with session-level settings folded in
    pub(crate) fn effective_browser(&self) -> BrowserConfig {
        let mut browser = self.browser.clone();
        if self.mock_browser && browser.user_agent.is_none() {
            browser.user_agent = Some(self.user_agent.clone());
        }
        if !self.verify_tls {
            browser.ignore_https_errors = true;
        }
        browser
    }
}

/// Browser launch options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    /// Run Chrome with its sandbox; off by default (`--no-sandbox`)
    pub sandbox: bool,
    /// Browser binary; auto-discovered when unset
    pub executable: Option<PathBuf>,
    /// Extra command-line switches
    pub args: Vec<String>,
    pub viewport: Viewport,
    /// User agent for render pages
    pub user_agent: Option<String>,
    /// The engine shuts itself down after this long without activity
    pub idle_timeout_ms: u64,
    pub ignore_https_errors: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            sandbox: false,
            executable: None,
            args: Vec::new(),
            viewport: Viewport::default(),
            user_agent: None,
            idle_timeout_ms: 600_000,
            ignore_https_errors: false,
        }
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Parameters of one `render` call
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Lifecycle point to wait for after loading; `None` relies on the
    /// navigation's own load wait
    pub wait_until: Option<LoadEvent>,
    /// Script evaluated after the content loads; its result is returned
    pub script: Option<String>,
    /// Settle period after load (and script)
    pub wait: Duration,
    /// Number of scroll-to-bottom passes
    pub scroll_down: u32,
    /// Settle delay after each scroll
    pub sleep: Duration,
    /// Deadline for the whole render
    pub timeout: Duration,
    /// Attempts made before a render failure is returned (at least one)
    pub retries: u32,
    /// Navigate to the live URL instead of loading the fetched markup
    pub reload: bool,
    /// Start from the last rendered markup instead of the static markup
    pub incremental: bool,
    /// Keep the page open after rendering; see `Document::page`
    pub keep_page: bool,
    /// Cookies set on the page before loading
    pub cookies: Vec<CookieParam>,
    /// Also forward the session's cookies for the document URL
    pub send_session_cookies: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            wait_until: None,
            script: None,
            wait: Duration::from_millis(200),
            scroll_down: 0,
            sleep: Duration::from_millis(100),
            timeout: Duration::from_secs(8),
            retries: 1,
            reload: false,
            incremental: false,
            keep_page: false,
            cookies: Vec::new(),
            send_session_cookies: false,
        }
    }
}

impl RenderOptions {
    pub fn with_script(script: impl Into<String>) -> Self {
        Self {
            script: Some(script.into()),
            ..Default::default()
        }
    }
}

/// Result of JavaScript execution
///
/// `value` is the JSON serialization of what the script returned (or the
/// error message when it threw). `is_error` indicates whether the script
/// threw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptResult {
    /// Serialized result value
    pub value: String,
    /// Whether the script threw an error
    pub is_error: bool,
}

impl ScriptResult {
    pub fn ok(value: impl Into<String>) -> Self {
        Self { value: value.into(), is_error: false }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { value: message.into(), is_error: true }
    }

    /// The value parsed as JSON, if it is JSON
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.value).ok()
    }
}

/// Parameters for setting a cookie on a render page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieParam {
    pub name: String,
    pub value: String,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: Option<bool>,
    pub http_only: Option<bool>,
    pub same_site: Option<String>,
    pub expires: Option<u64>,
}

impl CookieParam {
    /// A cookie scoped to `url`
    pub fn for_url(name: impl Into<String>, value: impl Into<String>, url: &str) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            url: Some(url.to_string()),
            ..Default::default()
        }
    }
}
