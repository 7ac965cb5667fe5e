//! Blocking session: HTTP fetches that produce render-capable documents

use crate::document::Document;
use crate::engine::{default_launcher, EngineLauncher};
use crate::manager::RenderEngineManager;
use crate::{Error, Result, SessionConfig};
use encoding_rs::{Encoding, UTF_8};
use log::{debug, warn};
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::redirect::Policy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A fetched response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    /// Final URL after redirects
    pub url: Url,
    pub body: Vec<u8>,
}

impl Response {
    /// Charset label from the `Content-Type` header, if any
    pub fn declared_encoding(&self) -> Option<String> {
        let content_type = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        charset_param(content_type)
    }
}

fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// HTTP method of a [`RequestOptions`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// A request beyond the plain `get`/`post`/`head` helpers
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Overrides the session timeout
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), ..Default::default() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

pub(crate) fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Config(format!("invalid header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Config(format!("invalid header value for {}: {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Default headers for every request of a session
pub(crate) fn session_headers(config: &SessionConfig) -> Result<HeaderMap> {
    let mut map = header_map(&config.headers)?;
    if config.mock_browser && !map.contains_key(USER_AGENT) {
        let ua = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| Error::Config(format!("invalid user agent: {}", e)))?;
        map.insert(USER_AGENT, ua);
    }
    Ok(map)
}

pub(crate) fn redirect_policy(config: &SessionConfig) -> Policy {
    if config.follow_redirects {
        Policy::limited(10)
    } else {
        Policy::none()
    }
}

pub(crate) fn fallback_encoding(config: &SessionConfig) -> &'static Encoding {
    match Encoding::for_label(config.default_encoding.trim().as_bytes()) {
        Some(enc) => enc,
        None => {
            warn!("Unknown default encoding {:?}; using UTF-8", config.default_encoding);
            UTF_8
        }
    }
}

pub(crate) fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| Error::Network(format!("invalid URL {:?}: {}", url, e)))
}

/// Fetches pages and hands out [`Document`]s bound to one render engine.
///
/// The engine is launched on the first render and shut down by
/// [`close`](Self::close).
pub struct Session {
    client: reqwest::blocking::Client,
    config: SessionConfig,
    jar: Arc<Jar>,
    manager: RenderEngineManager,
    fallback: &'static Encoding,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("manager", &self.manager).finish()
    }
}

impl Session {
    /// A session with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Result<Self> {
        Self::with_launcher(config, default_launcher())
    }

    /// A session whose renders go through a custom engine launcher
    pub fn with_launcher(config: SessionConfig, launcher: Arc<dyn EngineLauncher>) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = reqwest::blocking::Client::builder()
            .default_headers(session_headers(&config)?)
            .cookie_provider(Arc::clone(&jar))
            .redirect(redirect_policy(&config))
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        let manager = RenderEngineManager::with_launcher(config.effective_browser(), launcher);
        Ok(Self {
            client,
            fallback: fallback_encoding(&config),
            config,
            jar,
            manager,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The render engine shared by this session's documents
    pub fn manager(&self) -> &RenderEngineManager {
        &self.manager
    }

    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    pub fn get(&self, url: &str) -> Result<Document> {
        self.request(RequestOptions::new(Method::Get, url))
    }

    pub fn post(&self, url: &str, body: impl Into<Vec<u8>>) -> Result<Document> {
        self.request(RequestOptions::new(Method::Post, url).body(body))
    }

    pub fn head(&self, url: &str) -> Result<Document> {
        self.request(RequestOptions::new(Method::Head, url))
    }

    /// Perform a request. Any HTTP status yields a document; only transport
    /// failures are errors.
    pub fn request(&self, opts: RequestOptions) -> Result<Document> {
        if self.manager.is_closed() {
            return Err(Error::EngineClosed);
        }
        let url = parse_url(&opts.url)?;
        let mut req = self
            .client
            .request(opts.method.into(), url)
            .headers(header_map(&opts.headers)?);
        if !opts.query.is_empty() {
            req = req.query(&opts.query);
        }
        if let Some(body) = opts.body {
            req = req.body(body);
        }
        if let Some(timeout) = opts.timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send()?;
        let response = Response {
            status: resp.status().as_u16(),
            headers: resp.headers().clone(),
            url: resp.url().clone(),
            body: resp.bytes()?.to_vec(),
        };
        debug!("{:?} {} -> {}", opts.method, response.url, response.status);
        Ok(self.document(response))
    }

    pub(crate) fn document(&self, response: Response) -> Document {
        Document::from_response(
            response,
            self.fallback,
            Some(self.manager.clone()),
            Some(Arc::clone(&self.jar)),
        )
    }

    /// Wrap markup that was not fetched in a document bound to this session
    pub fn html(&self, markup: &str, url: &str) -> Result<Document> {
        let mut doc = Document::from_html(markup, url)?;
        doc.bind(self.manager.clone(), Some(Arc::clone(&self.jar)));
        Ok(doc)
    }

    /// Fetch the page `doc` links to as its next page, if it has one
    pub fn next_page(&self, doc: &Document) -> Result<Option<Document>> {
        match doc.next_page_url() {
            Some(url) => self.get(&url).map(Some),
            None => Ok(None),
        }
    }

    /// Shut down the render engine. Safe to call repeatedly and on sessions
    /// that never rendered; documents from this session can no longer render.
    pub fn close(&self) -> Result<()> {
        self.manager.close()
    }
}
