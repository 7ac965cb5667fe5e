//! Async session
//!
//! Tokio counterpart of the blocking session: the same documents and render
//! manager, with fetches on the async `reqwest` client bounded by a semaphore.

use crate::document::Document;
use crate::engine::{default_launcher, EngineLauncher};
use crate::manager::RenderEngineManager;
use crate::session::{
    fallback_encoding, header_map, parse_url, redirect_policy, session_headers, Method,
    RequestOptions, Response,
};
use crate::{Error, Result, SessionConfig};
use encoding_rs::Encoding;
use futures::future::join_all;
use log::debug;
use reqwest::cookie::Jar;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Non-blocking counterpart of [`Session`](crate::Session).
///
/// Fetches run on the async `reqwest` client; at most `workers` of them are
/// in flight at once. Documents it returns render through the same
/// serialized [`RenderEngineManager`] logic, via `Document::render_async`.
pub struct AsyncSession {
    client: reqwest::Client,
    config: SessionConfig,
    jar: Arc<Jar>,
    manager: RenderEngineManager,
    fallback: &'static Encoding,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for AsyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSession")
            .field("manager", &self.manager)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl AsyncSession {
    pub fn new() -> Result<Self> {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Result<Self> {
        Self::with_launcher(config, default_launcher())
    }

    pub fn with_launcher(config: SessionConfig, launcher: Arc<dyn EngineLauncher>) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
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
            permits: Arc::new(Semaphore::new(config.worker_count())),
            config,
            jar,
            manager,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn manager(&self) -> &RenderEngineManager {
        &self.manager
    }

    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    pub async fn get(&self, url: &str) -> Result<Document> {
        self.request(RequestOptions::new(Method::Get, url)).await
    }

    pub async fn post(&self, url: &str, body: impl Into<Vec<u8>>) -> Result<Document> {
        self.request(RequestOptions::new(Method::Post, url).body(body)).await
    }

    pub async fn head(&self, url: &str) -> Result<Document> {
        self.request(RequestOptions::new(Method::Head, url)).await
    }

    pub async fn request(&self, opts: RequestOptions) -> Result<Document> {
        let response = self.fetch(opts).await?;
        Ok(Document::from_response(
            response,
            self.fallback,
            Some(self.manager.clone()),
            Some(Arc::clone(&self.jar)),
        ))
    }

    async fn fetch(&self, opts: RequestOptions) -> Result<Response> {
        if self.manager.is_closed() {
            return Err(Error::EngineClosed);
        }
        let url = parse_url(&opts.url)?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Other("session fetch pool closed".into()))?;

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

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let url = resp.url().clone();
        let body = resp.bytes().await?.to_vec();
        debug!("{:?} {} -> {}", opts.method, url, status);
        Ok(Response { status, headers, url, body })
    }

    /// Bind markup that was not fetched to this session
    pub fn html(&self, markup: &str, url: &str) -> Result<Document> {
        let mut doc = Document::from_html(markup, url)?;
        doc.bind(self.manager.clone(), Some(Arc::clone(&self.jar)));
        Ok(doc)
    }

    pub async fn next_page(&self, doc: &Document) -> Result<Option<Document>> {
        match doc.next_page_url() {
            Some(url) => self.get(&url).await.map(Some),
            None => Ok(None),
        }
    }

    /// Drive several futures concurrently and collect their outputs in the
    /// order given
    pub async fn run<F, T>(&self, tasks: impl IntoIterator<Item = F>) -> Vec<T>
    where
        F: Future<Output = T>,
    {
        join_all(tasks).await
    }

    /// Shut down the render engine; idempotent
    pub async fn close(&self) -> Result<()> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.close())
            .await
            .map_err(|e| Error::Other(format!("close task failed: {}", e)))?
    }
}
