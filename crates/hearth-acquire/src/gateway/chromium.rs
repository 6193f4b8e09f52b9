//! Chromium-backed browser sessions using chromiumoxide.

use super::browser::{BrowserDriver, BrowserSession, GatewayResponse, SessionCookie};
use crate::config::GatewayConfig;
use crate::error::{AcquireError, AcquireResult};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, DeleteCookiesParams, TimeSinceEpoch,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Find the Chromium binary path.
pub fn find_chromium(explicit: Option<&Path>) -> Option<PathBuf> {
    // 1. Configured path
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }

    // 2. ~/.hearth-acquire/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".hearth-acquire/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".hearth-acquire/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
            ]
        } else {
            vec![
                home.join(".hearth-acquire/chromium/chrome-linux64/chrome"),
                home.join(".hearth-acquire/chromium/chrome"),
            ]
        };
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 4. Common macOS location
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Launches headless Chromium instances.
pub struct ChromiumDriver {
    executable: PathBuf,
    headless: bool,
}

impl ChromiumDriver {
    /// Locate Chromium according to `config`.
    pub fn new(config: &GatewayConfig) -> AcquireResult<Self> {
        let executable = find_chromium(config.chromium_path.as_deref()).ok_or_else(|| {
            AcquireError::BrowserUnavailable(
                "Chromium not found; set gateway.chromium_path or HEARTH_CHROMIUM_PATH".to_string(),
            )
        })?;
        Ok(Self {
            executable,
            headless: config.headless,
        })
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self) -> AcquireResult<Box<dyn BrowserSession>> {
        let mut builder = BrowserConfig::builder()
            .chrome_executable(&self.executable)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-blink-features=AutomationControlled");
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| AcquireError::BrowserUnavailable(format!("bad browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AcquireError::BrowserUnavailable(format!("failed to launch Chromium: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AcquireError::BrowserUnavailable(format!("failed to open page: {e}")))?;

        tracing::info!("Chromium launched from {}", self.executable.display());

        Ok(Box::new(ChromiumSession {
            browser,
            page,
            handler,
        }))
    }
}

/// One Chromium process with a single page.
pub struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

#[derive(Deserialize)]
struct FetchResult {
    status: u16,
    body: String,
}

fn browser_err(context: &'static str) -> impl Fn(chromiumoxide::error::CdpError) -> AcquireError {
    move |e| AcquireError::BrowserUnavailable(format!("{context}: {e}"))
}

impl ChromiumSession {
    async fn evaluate<T: serde::de::DeserializeOwned>(&self, script: String) -> AcquireResult<T> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(AcquireError::BrowserUnavailable)?;

        let result = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(browser_err("script evaluation failed"))?;

        result
            .into_value()
            .map_err(|e| AcquireError::TransientFailure(format!("unexpected script result: {e}")))
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> AcquireResult<()> {
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => {
                let _ = self.page.wait_for_navigation().await;
                Ok(())
            }
            Ok(Err(e)) => Err(AcquireError::UpstreamUnavailable(format!(
                "navigation failed: {e}"
            ))),
            Err(_) => Err(AcquireError::UpstreamUnavailable(format!(
                "navigation timed out after {timeout:?}"
            ))),
        }
    }

    async fn title(&self) -> AcquireResult<String> {
        Ok(self
            .page
            .get_title()
            .await
            .map_err(browser_err("failed to read title"))?
            .unwrap_or_default())
    }

    async fn content(&self) -> AcquireResult<String> {
        self.page
            .content()
            .await
            .map_err(browser_err("failed to read content"))
    }

    async fn cookies(&self) -> AcquireResult<Vec<SessionCookie>> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(browser_err("failed to read cookies"))?;

        Ok(cookies
            .into_iter()
            .map(|c| SessionCookie {
                expires: (!c.session && c.expires > 0.0).then_some(c.expires),
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                secure: c.secure,
                http_only: c.http_only,
            })
            .collect())
    }

    async fn set_cookies(&self, cookies: &[SessionCookie]) -> AcquireResult<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        let params = cookies
            .iter()
            .map(|c| {
                let mut param = CookieParam::new(c.name.clone(), c.value.clone());
                param.domain = Some(c.domain.clone());
                param.path = Some(c.path.clone());
                param.secure = Some(c.secure);
                param.http_only = Some(c.http_only);
                param.expires = c.expires.map(TimeSinceEpoch::new);
                param
            })
            .collect::<Vec<_>>();

        self.page
            .set_cookies(params)
            .await
            .map_err(browser_err("failed to set cookies"))?;
        Ok(())
    }

    async fn delete_cookies(&self, cookies: &[SessionCookie]) -> AcquireResult<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        let params = cookies
            .iter()
            .map(|c| {
                let mut param = DeleteCookiesParams::new(c.name.clone());
                param.domain = Some(c.domain.clone());
                param.path = Some(c.path.clone());
                param
            })
            .collect::<Vec<_>>();

        self.page
            .delete_cookies(params)
            .await
            .map_err(browser_err("failed to delete cookies"))?;
        Ok(())
    }

    async fn fetch(&self, url: &str) -> AcquireResult<GatewayResponse> {
        let url_literal = serde_json::to_string(url)
            .map_err(|e| AcquireError::TransientFailure(format!("unencodable url: {e}")))?;
        let script = format!(
            "(async () => {{ \
               const r = await fetch({url_literal}, {{ credentials: 'include', headers: {{ 'Accept': 'application/json' }} }}); \
               return {{ status: r.status, body: await r.text() }}; \
             }})()"
        );

        let result: FetchResult = self.evaluate(script).await?;
        Ok(GatewayResponse {
            status: result.status,
            body: result.body,
        })
    }

    async fn probe(&self) -> AcquireResult<()> {
        let two: i64 = self.evaluate("1 + 1".to_string()).await?;
        if two == 2 {
            Ok(())
        } else {
            Err(AcquireError::BrowserUnavailable(format!(
                "health probe returned {two}"
            )))
        }
    }

    async fn close(self: Box<Self>) -> AcquireResult<()> {
        let ChromiumSession {
            mut browser,
            page,
            handler,
        } = *self;
        let _ = page.close().await;
        let _ = browser.close().await;
        let _ = browser.wait().await;
        handler.abort();
        Ok(())
    }
}
