//! DevTools HTTP discovery.
//!
//! The debugger's websocket path changes on every host restart, so the
//! URL is looked up over HTTP rather than configured:
//!
//! - `GET /json/version` returns the browser-level `webSocketDebuggerUrl`.
//! - `GET /json` lists page targets, each with its own websocket URL.
//!
//! Calls are blocking (`reqwest::blocking`) because they run on tunnel
//! threads and during bootstrap, never inside an async context.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;

use crate::endpoint::Endpoint;

/// Timeout applied to every discovery request.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Discovery failures.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The HTTP request failed or returned a non-success status.
    #[error("request to {url} failed: {source}")]
    Http {
        /// Requested URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },
    /// The response body was not the expected JSON document.
    #[error("unexpected response from {url}: {source}")]
    Decode {
        /// Requested URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },
    /// No page target had the requested title.
    #[error("no debugger target titled '{0}'")]
    TargetNotFound(String),
    /// The target exists but exposes no websocket URL (already attached).
    #[error("debugger target '{0}' has no websocket URL")]
    TargetUnattachable(String),
}

/// `/json/version` document.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserVersion {
    /// Browser product string.
    #[serde(rename = "Browser", default)]
    pub browser: Option<String>,
    /// DevTools protocol version.
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: Option<String>,
    /// Browser-level websocket URL.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
}

/// One entry of the `/json` target list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    /// Target id.
    pub id: String,
    /// Page title.
    #[serde(default)]
    pub title: String,
    /// Target type (`page`, `service_worker`, ...).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Current URL of the target.
    #[serde(default)]
    pub url: String,
    /// Websocket URL; absent when another client is attached.
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

/// Blocking client for the DevTools HTTP endpoints.
#[derive(Debug, Clone)]
pub struct DebuggerClient {
    client: Client,
    endpoint: Endpoint,
}

impl DebuggerClient {
    /// Create a client for `endpoint`.
    pub fn new(endpoint: Endpoint) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(DISCOVERY_TIMEOUT).build()?;
        Ok(Self { client, endpoint })
    }

    /// The endpoint this client talks to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T, DiscoveryError> {
        let response = self
            .client
            .get(&url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|source| DiscoveryError::Http {
                url: url.clone(),
                source,
            })?;

        response
            .json::<T>()
            .map_err(|source| DiscoveryError::Decode { url, source })
    }

    /// Fetch `/json/version`.
    pub fn browser_version(&self) -> Result<BrowserVersion, DiscoveryError> {
        self.get_json(self.endpoint.discovery_url())
    }

    /// Browser-level websocket URL.
    pub fn browser_ws_url(&self) -> Result<String, DiscoveryError> {
        let version = self.browser_version()?;
        log::debug!(
            "[Discovery] {} -> {}",
            version.browser.as_deref().unwrap_or("unknown browser"),
            version.web_socket_debugger_url
        );
        Ok(version.web_socket_debugger_url)
    }

    /// Fetch the `/json` target list.
    pub fn targets(&self) -> Result<Vec<TargetInfo>, DiscoveryError> {
        self.get_json(format!("{}/json", self.endpoint.base_url()))
    }

    /// Websocket URL of the first target titled `title`.
    pub fn target_ws_url(&self, title: &str) -> Result<String, DiscoveryError> {
        let target = self
            .targets()?
            .into_iter()
            .find(|t| t.title == title)
            .ok_or_else(|| DiscoveryError::TargetNotFound(title.to_string()))?;

        target
            .web_socket_debugger_url
            .ok_or_else(|| DiscoveryError::TargetUnattachable(title.to_string()))
    }
}
