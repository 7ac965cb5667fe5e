//! A fetched page: its response, a lazily parsed static tree and, once
//! rendered, a second tree built from the browser's DOM.

use crate::element::{Element, FindOptions, Query, Selection, XPathItem};
use crate::links::{self, LinkCandidate, DEFAULT_NEXT_SYMBOLS};
use crate::manager::{KeptPage, RenderContent, RenderEngineManager, RenderJob, RenderOutput};
use crate::session::Response;
use crate::template::Captures;
use crate::tree::DocumentTree;
use crate::{CookieParam, Error, RenderOptions, Result, ScriptResult};
use encoding_rs::{Encoding, UTF_8};
use log::{debug, warn};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderMap;
use std::cell::OnceCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use url::Url;

pub struct Document {
    response: Response,
    url: Url,
    fallback_encoding: &'static Encoding,
    static_tree: OnceCell<Rc<DocumentTree>>,
    rendered: Option<Rc<DocumentTree>>,
    last_render: Option<RenderOptions>,
    manager: Option<RenderEngineManager>,
    cookie_jar: Option<Arc<Jar>>,
    page: Option<KeptPage>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("url", &self.url.as_str())
            .field("status", &self.response.status)
            .field("rendered", &self.is_rendered())
            .finish()
    }
}

impl Document {
    pub(crate) fn from_response(
        response: Response,
        fallback_encoding: &'static Encoding,
        manager: Option<RenderEngineManager>,
        cookie_jar: Option<Arc<Jar>>,
    ) -> Self {
        Self {
            url: response.url.clone(),
            response,
            fallback_encoding,
            static_tree: OnceCell::new(),
            rendered: None,
            last_render: None,
            manager,
            cookie_jar,
            page: None,
        }
    }

    /// A document over markup that was not fetched; `url` is its base URL.
    /// It has no render engine until [`bind`](Self::bind) is called.
    pub fn from_html(markup: &str, url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid document URL {:?}: {}", url, e)))?;
        let response = Response {
            status: 200,
            headers: HeaderMap::new(),
            url,
            body: markup.as_bytes().to_vec(),
        };
        Ok(Self::from_response(response, UTF_8, None, None))
    }

    /// Attach a render engine, and optionally the cookie jar whose cookies
    /// `send_session_cookies` forwards to the page
    pub fn bind(&mut self, manager: RenderEngineManager, cookie_jar: Option<Arc<Jar>>) {
        self.manager = Some(manager);
        self.cookie_jar = cookie_jar;
    }

    pub fn manager(&self) -> Option<&RenderEngineManager> {
        self.manager.as_ref()
    }

    pub fn status(&self) -> u16 {
        self.response.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.response.headers
    }

    /// Final URL after redirects
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Tree parsed from the response body, built on first access
    pub fn static_tree(&self) -> Rc<DocumentTree> {
        Rc::clone(self.static_tree.get_or_init(|| {
            let declared = self.response.declared_encoding();
            Rc::new(DocumentTree::parse_with_fallback(
                &self.response.body,
                declared.as_deref(),
                self.fallback_encoding,
            ))
        }))
    }

    /// The rendered tree if there is one, else the static tree
    pub fn current_tree(&self) -> Rc<DocumentTree> {
        match &self.rendered {
            Some(tree) => Rc::clone(tree),
            None => self.static_tree(),
        }
    }

    pub fn is_rendered(&self) -> bool {
        self.rendered.is_some()
    }

    /// Options of the last successful render
    pub fn last_render(&self) -> Option<&RenderOptions> {
        self.last_render.as_ref()
    }

    /// Encoding the static markup was decoded with
    pub fn encoding(&self) -> &'static str {
        self.static_tree().encoding()
    }

    /// Markup of the current tree as received (decoded response body, or the
    /// browser's serialization once rendered)
    pub fn html(&self) -> String {
        self.current_tree().source().to_string()
    }

    /// Current tree re-serialized by the parser
    pub fn raw_html(&self) -> String {
        self.current_tree().raw_html()
    }

    pub fn text(&self) -> String {
        self.current_tree().text()
    }

    pub fn full_text(&self) -> String {
        self.current_tree().full_text()
    }

    fn with_query<T>(&self, f: impl FnOnce(&Query<'_>) -> T) -> T {
        let tree = self.current_tree();
        let query = Query { tree: &tree, scope: tree.root(), url: &self.url };
        f(&query)
    }

    pub fn find(&self, selector: &str) -> Result<Vec<Element>> {
        Ok(self.find_with(selector, &FindOptions::default())?.into_vec())
    }

    pub fn find_first(&self, selector: &str) -> Result<Option<Element>> {
        Ok(self.find_with(selector, &FindOptions::first())?.first())
    }

    pub fn find_with(&self, selector: &str, opts: &FindOptions) -> Result<Selection> {
        self.with_query(|q| q.find_with(selector, opts))
    }

    pub fn xpath(&self, expr: &str) -> Result<Vec<XPathItem>> {
        self.with_query(|q| q.xpath(expr))
    }

    pub fn xpath_first(&self, expr: &str) -> Result<Option<XPathItem>> {
        Ok(self.xpath(expr)?.into_iter().next())
    }

    pub fn search(&self, template: &str) -> Result<Option<Captures>> {
        self.with_query(|q| q.search(template))
    }

    pub fn search_all(&self, template: &str) -> Result<Vec<Captures>> {
        self.with_query(|q| q.search_all(template))
    }

    pub fn links(&self) -> BTreeSet<String> {
        self.with_query(|q| q.links())
    }

    pub fn absolute_links(&self) -> BTreeSet<String> {
        self.with_query(|q| q.absolute_links())
    }

    /// Document URL, or the `<base href>` target when the page declares one
    pub fn base_url(&self) -> Url {
        self.with_query(|q| q.base_url())
    }

    /// Absolute URL of the most likely "next page" link
    pub fn next_page_url(&self) -> Option<String> {
        self.next_page_url_with(DEFAULT_NEXT_SYMBOLS)
    }

    /// Like [`next_page_url`](Self::next_page_url) with custom link texts
    pub fn next_page_url_with(&self, symbols: &[&str]) -> Option<String> {
        let opts = FindOptions::containing(symbols.iter().copied());
        let anchors = self.find_with("a", &opts).ok()?.into_vec();
        let candidates: Vec<LinkCandidate> = anchors
            .iter()
            .map(|a| {
                let attrs = a.attrs();
                LinkCandidate {
                    href: attrs.text("href").map(str::to_string),
                    rel: attrs.list("rel").to_vec(),
                    classes: attrs.list("class").to_vec(),
                }
            })
            .collect();
        let href = links::pick_next(&candidates)?;
        links::resolve_url(&self.base_url(), &href)
    }

    /// The page kept open by the last `keep_page` render
    pub fn page(&self) -> Option<&KeptPage> {
        self.page.as_ref()
    }

    pub fn take_page(&mut self) -> Option<KeptPage> {
        self.page.take()
    }

    fn session_cookies(&self) -> Vec<CookieParam> {
        let Some(jar) = &self.cookie_jar else {
            return Vec::new();
        };
        let Some(header) = jar.cookies(&self.url) else {
            return Vec::new();
        };
        let Ok(header) = header.to_str() else {
            return Vec::new();
        };
        header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .map(|(name, value)| CookieParam::for_url(name, value, self.url.as_str()))
            .collect()
    }

    fn render_job(&self, opts: &RenderOptions) -> RenderJob {
        let content = if opts.reload {
            RenderContent::Url(self.url.to_string())
        } else {
            let source = match (&self.rendered, opts.incremental) {
                (Some(rendered), true) => Rc::clone(rendered),
                _ => self.static_tree(),
            };
            RenderContent::Markup(source.source().to_string())
        };

        let mut cookies = opts.cookies.clone();
        if opts.send_session_cookies {
            cookies.extend(self.session_cookies());
        }

        RenderJob {
            content,
            wait_until: opts.wait_until,
            script: opts.script.clone(),
            wait: opts.wait,
            scroll_down: opts.scroll_down,
            sleep: opts.sleep,
            timeout: opts.timeout,
            cookies,
            keep_page: opts.keep_page,
        }
    }

    fn apply(&mut self, output: RenderOutput, opts: &RenderOptions) -> Option<ScriptResult> {
        self.rendered = Some(Rc::new(DocumentTree::from_markup(&output.html)));
        self.last_render = Some(opts.clone());
        if let Some(page) = output.page {
            if let Some(old) = self.page.replace(page) {
                if let Err(e) = old.close() {
                    warn!("Failed to close previously kept page: {}", e);
                }
            }
        }
        output.script_result
    }

    fn retryable(err: &Error, attempt: u32, attempts: u32) -> bool {
        attempt < attempts && err.is_render_failure() && !matches!(err, Error::EngineClosed)
    }

    /// Load the document into the session's browser, run `opts.script`, let
    /// the page settle and replace the rendered tree with the resulting DOM.
    ///
    /// Returns what the script evaluated to. Elements taken from earlier
    /// trees stay valid. On failure the previous trees are left untouched.
    pub fn render(&mut self, opts: &RenderOptions) -> Result<Option<ScriptResult>> {
        let manager = self.manager.clone().ok_or(Error::Unbound)?;
        let attempts = opts.retries.max(1);
        let mut attempt = 1;
        loop {
            match manager.render(self.render_job(opts)) {
                Ok(output) => return Ok(self.apply(output, opts)),
                Err(e) if Self::retryable(&e, attempt, attempts) => {
                    warn!("render of {} failed (attempt {}/{}): {}", self.url, attempt, attempts, e);
                    attempt += 1;
                }
                Err(e) => {
                    debug!("render of {} failed: {}", self.url, e);
                    return Err(e);
                }
            }
        }
    }

    /// Async variant of [`render`](Self::render)
    pub async fn render_async(&mut self, opts: &RenderOptions) -> Result<Option<ScriptResult>> {
        let manager = self.manager.clone().ok_or(Error::Unbound)?;
        let attempts = opts.retries.max(1);
        let mut attempt = 1;
        loop {
            match manager.render_async(self.render_job(opts)).await {
                Ok(output) => return Ok(self.apply(output, opts)),
                Err(e) if Self::retryable(&e, attempt, attempts) => {
                    warn!("render of {} failed (attempt {}/{}): {}", self.url, attempt, attempts, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
