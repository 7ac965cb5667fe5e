//! Chrome DevTools Protocol adapter implementation

use crate::engine::{is_function_script, BrowserEngine, BrowserPage, EngineLauncher};
use crate::{BrowserConfig, CookieParam, Error, Result, ScriptResult};
use base64::Engine as Base64Engine;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Network::{CookieParam as NetCookieParam, CookieSameSite};
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

/// Launches headless Chrome through the `headless_chrome` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct ChromeLauncher;

impl EngineLauncher for ChromeLauncher {
    fn launch(&self, config: &BrowserConfig) -> Result<Box<dyn BrowserEngine>> {
        let args: Vec<&OsStr> = config.args.iter().map(OsStr::new).collect();

        // Configure headless Chrome launch options
        let launch_options = LaunchOptions::default_builder()
            .headless(config.headless)
            .sandbox(config.sandbox)
            .window_size(Some((config.viewport.width, config.viewport.height)))
            .path(config.executable.clone())
            .args(args)
            .ignore_certificate_errors(config.ignore_https_errors)
            .idle_browser_timeout(Duration::from_millis(config.idle_timeout_ms))
            .build()
            .map_err(|e| Error::EngineLaunch(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::EngineLaunch(format!("Failed to launch browser: {}", e)))?;
        debug!("launched headless chrome ({})", if config.headless { "headless" } else { "headed" });

        Ok(Box::new(ChromeEngine { browser: Some(browser) }))
    }
}

/// A running Chrome process
pub struct ChromeEngine {
    browser: Option<Browser>,
}

impl BrowserEngine for ChromeEngine {
    fn new_page(&mut self) -> Result<Box<dyn BrowserPage>> {
        let browser = self.browser.as_ref().ok_or(Error::EngineClosed)?;
        let tab = browser
            .new_tab()
            .map_err(|e| Error::Render(format!("Failed to create tab: {}", e)))?;
        Ok(Box::new(ChromePage { tab }))
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the Browser kills the child process
        drop(self.browser.take());
        Ok(())
    }
}

/// One Chrome tab
pub struct ChromePage {
    tab: Arc<Tab>,
}

/// Markup as a `data:` URL the tab can navigate to
pub fn markup_data_url(markup: &str) -> String {
    format!(
        "data:text/html;charset=utf-8;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(markup)
    )
}

/// Wrap a user script so it always resolves to a JSON string of either
/// `{"ok": value}` or `{"err": message}`. The script travels base64-encoded
/// so it needs no escaping; function-shaped scripts are called.
pub fn script_wrapper(script: &str) -> String {
    let source = if is_function_script(script) {
        format!("({})", script.trim())
    } else {
        script.to_string()
    };
    let b64 = base64::engine::general_purpose::STANDARD.encode(source);
    let call = if is_function_script(script) { "true" } else { "false" };

    let template = r#"(async function(){
        try {
            const bytes = Uint8Array.from(atob("{{B64_TOKEN}}"), function(c){ return c.charCodeAt(0); });
            const src = new TextDecoder().decode(bytes);
            let r = (0, eval)(src);
            if ({{CALL}} && typeof r === 'function') r = r();
            r = await r;
            try {
                return JSON.stringify({ ok: r === undefined ? null : r });
            } catch (e) {
                return JSON.stringify({ ok: String(r) });
            }
        } catch (e) {
            return JSON.stringify({ err: String(e) });
        }
    })()"#;

    template.replace("{{B64_TOKEN}}", &b64).replace("{{CALL}}", call)
}

/// Turn the wrapper's JSON envelope into a `ScriptResult`
pub fn parse_script_envelope(raw: &serde_json::Value) -> ScriptResult {
    let parsed = match raw.as_str() {
        Some(s) => serde_json::from_str::<serde_json::Value>(s)
            .unwrap_or_else(|_| serde_json::Value::String(s.to_string())),
        None => raw.clone(),
    };

    if let Some(err) = parsed.get("err") {
        let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return ScriptResult::error(message);
    }
    match parsed.get("ok") {
        Some(value) => ScriptResult::ok(value.to_string()),
        None => ScriptResult::ok(parsed.to_string()),
    }
}

fn cookie_to_cdp(c: CookieParam) -> NetCookieParam {
    NetCookieParam {
        name: c.name,
        value: c.value,
        url: c.url,
        domain: c.domain,
        path: c.path,
        secure: c.secure,
        http_only: c.http_only,
        same_site: c.same_site.and_then(|s| match s.as_str() {
            "Strict" | "strict" => Some(CookieSameSite::Strict),
            "Lax" | "lax" => Some(CookieSameSite::Lax),
            "None" | "none" => Some(CookieSameSite::None),
            _ => None,
        }),
        expires: c.expires.map(|v| v as f64),
        priority: None,
        same_party: None,
        source_scheme: None,
        source_port: None,
        partition_key: None,
    }
}

impl ChromePage {
    fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        self.tab.set_default_timeout(timeout);
        self.tab
            .navigate_to(url)
            .map_err(|e| Error::Render(format!("Navigation failed: {}", e)))?;
        self.tab
            .wait_until_navigated()
            .map_err(|e| Error::Render(format!("Wait for navigation failed: {}", e)))?;
        Ok(())
    }
}

impl BrowserPage for ChromePage {
    fn goto(&mut self, url: &str, timeout: Duration) -> Result<()> {
        self.navigate(url, timeout)
    }

    fn set_content(&mut self, markup: &str, timeout: Duration) -> Result<()> {
        self.navigate(&markup_data_url(markup), timeout)
    }

    fn evaluate(&mut self, script: &str, timeout: Duration) -> Result<ScriptResult> {
        self.tab.set_default_timeout(timeout);
        let eval = self
            .tab
            .evaluate(&script_wrapper(script), true)
            .map_err(|e| Error::Script(format!("Evaluation failed: {}", e)))?;

        match eval.value {
            Some(val) => Ok(parse_script_envelope(&val)),
            None => Err(Error::Script("No value returned from evaluation".into())),
        }
    }

    fn content(&mut self, timeout: Duration) -> Result<String> {
        self.tab.set_default_timeout(timeout);
        self.tab
            .get_content()
            .map_err(|e| Error::Render(format!("Failed to read page content: {}", e)))
    }

    fn set_user_agent(&mut self, user_agent: &str) -> Result<()> {
        self.tab.set_user_agent(user_agent, None, None)?;
        Ok(())
    }

    fn set_cookies(&mut self, cookies: Vec<CookieParam>) -> Result<()> {
        let net_cookies = cookies.into_iter().map(cookie_to_cdp).collect();
        self.tab
            .set_cookies(net_cookies)
            .map_err(|e| Error::Other(format!("Failed to set cookies: {}", e)))
    }

    fn close(&mut self) -> Result<()> {
        if let Err(e) = self.tab.close(false) {
            warn!("Failed to close tab: {}", e);
        }
        Ok(())
    }
}
