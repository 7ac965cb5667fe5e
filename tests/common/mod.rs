//! Shared helpers: a scripted browser engine and a tiny HTTP server

#![allow(dead_code)]

use rfhtml::engine::{BrowserEngine, BrowserPage, EngineLauncher};
use rfhtml::{BrowserConfig, CookieParam, Error, Result, ScriptResult};
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tiny_http::{Header, Response, Server};

/// One engine interaction recorded by the stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub page: usize,
    pub step: &'static str,
    pub enter: bool,
}

/// Shared state of a [`StubLauncher`] and everything it launched
#[derive(Default)]
pub struct StubState {
    pub events: Mutex<Vec<Event>>,
    pub launches: AtomicUsize,
    pub engine_closes: AtomicUsize,
    pub pages_opened: AtomicUsize,
    pub pages_closed: AtomicUsize,
    pub cookies: Mutex<Vec<CookieParam>>,
    pub user_agents: Mutex<Vec<String>>,
    /// Live pages served to `goto`
    pub sites: Mutex<HashMap<String, String>>,
    /// Launch attempts that fail before launches succeed
    pub failing_launches: AtomicUsize,
}

impl StubState {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// True when every page's events form one contiguous block and each
    /// enter is immediately followed by its exit
    pub fn renders_serialized(&self) -> bool {
        let events = self.events();
        let mut finished: Vec<usize> = Vec::new();
        let mut current: Option<usize> = None;
        for pair in events.chunks(2) {
            let [enter, exit] = pair else { return false };
            if !enter.enter || exit.enter || enter.page != exit.page || enter.step != exit.step {
                return false;
            }
            if current != Some(enter.page) {
                if finished.contains(&enter.page) {
                    return false;
                }
                if let Some(prev) = current {
                    finished.push(prev);
                }
                current = Some(enter.page);
            }
        }
        true
    }
}

/// Launcher for a scripted engine.
///
/// Pages understand two markers in loaded markup: a
/// `<script data-stub-append="...">` inserts its attribute value before
/// `</body>` once `data-stub-delay-ms` milliseconds have passed since load,
/// and the text `stub:hang` makes serialization take `hang` long.
pub struct StubLauncher {
    pub state: Arc<StubState>,
    pub step_delay: Duration,
    pub hang: Duration,
}

impl StubLauncher {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StubState::default()),
            step_delay: Duration::from_millis(5),
            hang: Duration::from_millis(400),
        }
    }

    pub fn shared(self) -> (Arc<StubState>, Arc<dyn EngineLauncher>) {
        (Arc::clone(&self.state), Arc::new(self))
    }
}

impl EngineLauncher for StubLauncher {
    fn launch(&self, _config: &BrowserConfig) -> Result<Box<dyn BrowserEngine>> {
        let failing = &self.state.failing_launches;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::EngineLaunch("stub browser missing".into()));
        }
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubEngine {
            state: Arc::clone(&self.state),
            step_delay: self.step_delay,
            hang: self.hang,
        }))
    }
}

struct StubEngine {
    state: Arc<StubState>,
    step_delay: Duration,
    hang: Duration,
}

impl BrowserEngine for StubEngine {
    fn new_page(&mut self) -> Result<Box<dyn BrowserPage>> {
        let id = self.state.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubPage {
            id,
            state: Arc::clone(&self.state),
            step_delay: self.step_delay,
            hang: self.hang,
            dom: String::new(),
            loaded_at: Instant::now(),
            pending: None,
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.state.engine_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct StubPage {
    id: usize,
    state: Arc<StubState>,
    step_delay: Duration,
    hang: Duration,
    dom: String,
    loaded_at: Instant,
    /// Markup a page script will append, and when
    pending: Option<(String, Duration)>,
}

impl StubPage {
    fn record<T>(&mut self, step: &'static str, f: impl FnOnce(&mut Self) -> T) -> T {
        self.state.events.lock().unwrap().push(Event { page: self.id, step, enter: true });
        thread::sleep(self.step_delay);
        let out = f(self);
        self.state.events.lock().unwrap().push(Event { page: self.id, step, enter: false });
        out
    }

    fn load(&mut self, markup: &str) {
        let doc = Html::parse_document(markup);
        let sel = Selector::parse("script[data-stub-append]").unwrap();
        self.pending = doc.select(&sel).next().map(|script| {
            let append = script.value().attr("data-stub-append").unwrap_or_default().to_string();
            let delay = script
                .value()
                .attr("data-stub-delay-ms")
                .and_then(|d| d.parse().ok())
                .unwrap_or(0);
            (append, Duration::from_millis(delay))
        });
        self.dom = markup.to_string();
        self.loaded_at = Instant::now();
    }

    fn apply_pending(&mut self) {
        let due = matches!(&self.pending, Some((_, delay)) if self.loaded_at.elapsed() >= *delay);
        if due {
            if let Some((append, _)) = self.pending.take() {
                self.dom = match self.dom.rfind("</body>") {
                    Some(at) => format!("{}{}{}", &self.dom[..at], append, &self.dom[at..]),
                    None => format!("{}{}", self.dom, append),
                };
            }
        }
    }
}

impl BrowserPage for StubPage {
    fn goto(&mut self, url: &str, _timeout: Duration) -> Result<()> {
        self.record("goto", |page| {
            let site = page.state.sites.lock().unwrap().get(url).cloned();
            match site {
                Some(markup) => {
                    page.load(&markup);
                    Ok(())
                }
                None => Err(Error::Render(format!("net::ERR_NAME_NOT_RESOLVED at {}", url))),
            }
        })
    }

    fn set_content(&mut self, markup: &str, _timeout: Duration) -> Result<()> {
        self.record("set_content", |page| {
            page.load(markup);
            Ok(())
        })
    }

    fn evaluate(&mut self, script: &str, _timeout: Duration) -> Result<ScriptResult> {
        self.record("evaluate", |page| {
            page.apply_pending();
            if script.starts_with("throw") {
                return Ok(ScriptResult::error(format!("Error: {}", script)));
            }
            if script.contains("document.title") {
                let doc = Html::parse_document(&page.dom);
                let title = doc
                    .select(&Selector::parse("title").unwrap())
                    .next()
                    .map(|t| t.text().collect::<String>())
                    .unwrap_or_default();
                return Ok(ScriptResult::ok(serde_json::to_string(&title).unwrap()));
            }
            Ok(ScriptResult::ok("null"))
        })
    }

    fn content(&mut self, _timeout: Duration) -> Result<String> {
        let hang = self.hang;
        self.record("content", |page| {
            page.apply_pending();
            if page.dom.contains("stub:hang") {
                thread::sleep(hang);
            }
            Ok(page.dom.clone())
        })
    }

    fn set_user_agent(&mut self, user_agent: &str) -> Result<()> {
        self.state.user_agents.lock().unwrap().push(user_agent.to_string());
        Ok(())
    }

    fn set_cookies(&mut self, cookies: Vec<CookieParam>) -> Result<()> {
        self.state.cookies.lock().unwrap().extend(cookies);
        Ok(())
    }

    fn scroll_to_bottom(&mut self, _timeout: Duration) -> Result<()> {
        self.record("scroll", |_| Ok(()))
    }

    fn close(&mut self) -> Result<()> {
        self.state.pages_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A page whose script appends `<div id="late">ok</div>` after `delay_ms`
pub fn late_page(delay_ms: u64) -> String {
    format!(
        r#"<html><head><title>late</title></head><body><p id="static">here</p><script data-stub-append='<div id="late">ok</div>' data-stub-delay-ms="{}">setTimeout(function(){{ document.body.insertAdjacentHTML('beforeend', '<div id="late">ok</div>'); }}, {});</script></body></html>"#,
        delay_ms, delay_ms
    )
}

/// Serve fixed routes on an ephemeral port; returns the base URL.
/// Each route maps a path to (status, headers, body).
pub fn serve(routes: Vec<(&'static str, u16, Vec<&'static str>, Vec<u8>)>) -> String {
    let server = Server::http("127.0.0.1:0").unwrap();
    let port = server.server_addr().to_ip().unwrap().port();
    thread::spawn(move || {
        for request in server.incoming_requests() {
            let path = request.url().split('?').next().unwrap_or("").to_string();
            let response = match routes.iter().find(|(p, ..)| *p == path) {
                Some((_, status, headers, body)) => {
                    let mut resp = Response::from_data(body.clone()).with_status_code(*status);
                    for h in headers {
                        resp = resp.with_header(h.parse::<Header>().unwrap());
                    }
                    resp
                }
                None => Response::from_data(b"Not Found".to_vec()).with_status_code(404),
            };
            let _ = request.respond(response);
        }
    });
    format!("http://127.0.0.1:{}", port)
}
