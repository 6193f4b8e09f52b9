//! Browser abstraction for the session gateway.
//!
//! Defines the `BrowserDriver` and `BrowserSession` traits that abstract over
//! the browser engine (Chromium via chromiumoxide in production, scripted
//! fakes in tests).

use crate::error::{classify_status, AcquireError, AcquireResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cookie as stored in the browser jar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Expiry as seconds since the Unix epoch; `None` for session cookies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn default_path() -> String {
    "/".to_string()
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_path(),
            expires: None,
            secure: true,
            http_only: true,
        }
    }
}

/// A per-user credential set that scopes fetches to one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable name used to tell identities apart.
    pub name: String,
    pub cookies: Vec<SessionCookie>,
}

impl Identity {
    pub fn new(name: impl Into<String>, cookies: Vec<SessionCookie>) -> Self {
        Self {
            name: name.into(),
            cookies,
        }
    }
}

/// Raw response of a fetch performed inside the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: String,
}

impl GatewayResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into its taxonomy error.
    pub fn error_for_status(self) -> AcquireResult<Self> {
        match classify_status(self.status, None) {
            None => Ok(self),
            Some(err) => Err(err),
        }
    }

    /// Deserialize the JSON body.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> AcquireResult<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| AcquireError::TransientFailure(format!("invalid JSON body: {e}")))
    }
}

/// Launches browser sessions.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Launch a fresh browser process with one page.
    async fn launch(&self) -> AcquireResult<Box<dyn BrowserSession>>;
}

/// A live browser with a single page and one shared cookie jar.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate the page to `url`.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> AcquireResult<()>;
    /// Current document title.
    async fn title(&self) -> AcquireResult<String>;
    /// Current document markup.
    async fn content(&self) -> AcquireResult<String>;
    /// Every cookie in the jar.
    async fn cookies(&self) -> AcquireResult<Vec<SessionCookie>>;
    /// Add or replace cookies.
    async fn set_cookies(&self, cookies: &[SessionCookie]) -> AcquireResult<()>;
    /// Remove cookies matching name and domain.
    async fn delete_cookies(&self, cookies: &[SessionCookie]) -> AcquireResult<()>;
    /// Issue a GET from inside the page so it carries the page's cookies and
    /// network fingerprint.
    async fn fetch(&self, url: &str) -> AcquireResult<GatewayResponse>;
    /// Trivial round-trip proving the browser still responds.
    async fn probe(&self) -> AcquireResult<()>;
    /// Shut the browser down.
    async fn close(self: Box<Self>) -> AcquireResult<()>;
}

/// A driver used when no browser is installed. Every launch fails with
/// `BrowserUnavailable`.
pub struct NoopDriver;

#[async_trait]
impl BrowserDriver for NoopDriver {
    async fn launch(&self) -> AcquireResult<Box<dyn BrowserSession>> {
        Err(AcquireError::BrowserUnavailable(
            "no browser available".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_for_status_maps_rejections() {
        let ok = GatewayResponse {
            status: 200,
            body: "{}".into(),
        };
        assert!(ok.clone().error_for_status().is_ok());

        let denied = GatewayResponse {
            status: 401,
            body: String::new(),
        };
        assert!(matches!(
            denied.error_for_status(),
            Err(AcquireError::UpstreamRejected { status: 401 })
        ));
    }

    #[test]
    fn json_body_parses() {
        let resp = GatewayResponse {
            status: 200,
            body: r#"{"dust": 1200}"#.into(),
        };
        let v: serde_json::Value = resp.json().unwrap();
        assert_eq!(v["dust"], 1200);
    }

    #[test]
    fn identity_deserializes_with_cookie_defaults() {
        let identity: Identity = serde_json::from_str(
            r#"{"name":"alice","cookies":[{"name":"sessionid","value":"abc","domain":".hsreplay.net"}]}"#,
        )
        .unwrap();
        assert_eq!(identity.cookies[0].path, "/");
        assert_eq!(identity.cookies[0].expires, None);
    }

    #[tokio::test]
    async fn noop_driver_is_unavailable() {
        assert!(matches!(
            NoopDriver.launch().await,
            Err(AcquireError::BrowserUnavailable(_))
        ));
    }
}
