//! Startup and shutdown orchestration.
//!
//! ```text
//! Config + host args
//!   │
//!   ├─ EndpointResolver::wait_until_available   (WrongOwner ⇒ fatal)
//!   ├─ DebuggerClient::browser_ws_url            (failure ⇒ fatal)
//!   ├─ updater::ensure_up_to_date per module     (failures logged)
//!   ├─ TunnelService: "browser" tunnel, optional "shared" tunnel
//!   └─ RuntimeManager: load every enabled manifest
//! ```
//!
//! Shutdown reverses it: plugins unload first so their `on_unload` hooks
//! can still post, then the tunnels are cancelled and joined.

// Rust guideline compliant 2026-02

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::discovery::{DebuggerClient, DiscoveryError};
use crate::endpoint::{platform_probe, Endpoint, EndpointResolver, ResolveError, SafetyVerdict};
use crate::plugins::{manifest, RuntimeManager, RuntimeOptions, UnloadOutcome};
use crate::service::TunnelService;
use crate::sink::LogCrateSink;
use crate::tunnel::TunnelOptions;
use crate::updater;
use crate::ws::WsTransport;

/// Poll interval while waiting for the debugger port.
pub const ENDPOINT_POLL: Duration = Duration::from_millis(500);

/// How long startup waits for a first tunnel before loading plugins anyway.
pub const CONNECT_GRACE: Duration = Duration::from_secs(5);

/// Tunnel attached to the browser-level websocket.
pub const BROWSER_TUNNEL: &str = "browser";

/// Tunnel attached to the shared page target.
pub const SHARED_TUNNEL: &str = "shared";

/// How often [`Host::run_until`] checks the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Fatal startup errors. The binary prints these and exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Endpoint missing or held by the wrong process.
    #[error(transparent)]
    Endpoint(#[from] ResolveError),
    /// The debugger answered but its websocket URL could not be found.
    #[error("could not discover the debugger websocket at {endpoint}: {source}")]
    Discovery {
        /// Endpoint that was queried.
        endpoint: String,
        /// Underlying error.
        #[source]
        source: DiscoveryError,
    },
    /// Anything else that stops startup (threads, plugins directory).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of [`check`].
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// Resolved endpoint.
    pub endpoint: Endpoint,
    /// Safety check verdict.
    pub verdict: SafetyVerdict,
    /// Browser product string, when reported.
    pub browser: Option<String>,
    /// Browser-level websocket URL.
    pub ws_url: String,
}

/// Resolver for `host_args` using the platform probe.
pub fn resolver_for(config: &Config, host_args: Vec<String>) -> EndpointResolver {
    EndpointResolver::new(
        host_args,
        config.debugger_host.clone(),
        config.host_executable.clone(),
        platform_probe(),
    )
}

/// Run the safety check and discovery once, without starting anything.
pub fn check(config: &Config, host_args: Vec<String>) -> Result<CheckReport, BootstrapError> {
    check_with(&resolver_for(config, host_args))
}

/// [`check`] with an explicit resolver.
pub fn check_with(resolver: &EndpointResolver) -> Result<CheckReport, BootstrapError> {
    let verdict = resolver.verify()?;
    let endpoint = resolver.resolve();
    let client = DebuggerClient::new(endpoint.clone())?;
    let version = client.browser_version().map_err(|source| BootstrapError::Discovery {
        endpoint: endpoint.to_string(),
        source,
    })?;

    Ok(CheckReport {
        endpoint,
        verdict,
        browser: version.browser,
        ws_url: version.web_socket_debugger_url,
    })
}

/// Refresh every configured module mirror. Returns each path with whether
/// a usable copy exists afterwards.
pub fn update_modules(config: &Config) -> Vec<(PathBuf, bool)> {
    config
        .modules
        .iter()
        .map(|module| {
            let path = config.module_path(module);
            let ok = updater::ensure_up_to_date(&path, &module.remote);
            (path, ok)
        })
        .collect()
}

/// A running loader: tunnels plus plugins.
#[derive(Debug)]
pub struct Host {
    endpoint: Endpoint,
    service: TunnelService,
    plugins: RuntimeManager,
}

impl Host {
    /// Start everything for `host_args`.
    pub fn start(config: &Config, host_args: Vec<String>) -> Result<Self, BootstrapError> {
        Self::start_with(config, &resolver_for(config, host_args))
    }

    /// Start everything with an explicit resolver.
    pub fn start_with(config: &Config, resolver: &EndpointResolver) -> Result<Self, BootstrapError> {
        let endpoint = resolver.wait_until_available(config.endpoint_wait(), ENDPOINT_POLL)?;
        let client = DebuggerClient::new(endpoint.clone())?;
        let browser_url = client.browser_ws_url().map_err(|source| BootstrapError::Discovery {
            endpoint: endpoint.to_string(),
            source,
        })?;
        log::info!("[Bootstrap] Debugger at {} ({})", endpoint, browser_url);

        for (path, ok) in update_modules(config) {
            if !ok {
                log::warn!("[Bootstrap] Module {} is unavailable", path.display());
            }
        }

        let primary = if config.shared_target_title.is_some() {
            SHARED_TUNNEL
        } else {
            BROWSER_TUNNEL
        };
        let service = TunnelService::new(primary);
        let options = TunnelOptions {
            auto_reconnect: true,
            reconnect: config.reconnect_policy(),
        };

        // First attempt reuses the URL found above; later ones rediscover it
        let browser_client = client.clone();
        let mut first_url = Some(browser_url);
        service.spawn(BROWSER_TUNNEL, WsTransport, options.clone(), move || match first_url.take() {
            Some(url) => Ok(url),
            None => Ok(browser_client.browser_ws_url()?),
        })?;

        if let Some(title) = config.shared_target_title.clone() {
            let shared_client = client;
            service.spawn(SHARED_TUNNEL, WsTransport, options, move || {
                Ok(shared_client.target_ws_url(&title)?)
            })?;
        }

        if !service.wait_until_connected(CONNECT_GRACE) {
            log::warn!(
                "[Bootstrap] No tunnel connected within {:?}; loading plugins anyway",
                CONNECT_GRACE
            );
        }

        let plugins = RuntimeManager::new(
            service.bus(),
            Arc::new(LogCrateSink),
            RuntimeOptions {
                unload_timeout: config.unload_timeout(),
            },
        );

        let manifests = manifest::discover(&config.plugins_dir)?;
        for plugin in manifests.iter().filter(|m| m.enabled) {
            if let Err(e) = plugins.load(&plugin.name, plugin.to_entry()) {
                log::error!("[Bootstrap] {e}");
            }
        }
        log::info!(
            "[Bootstrap] Started {} of {} plugin(s) from {}",
            plugins.plugins().len(),
            manifests.len(),
            config.plugins_dir.display()
        );

        Ok(Self {
            endpoint,
            service,
            plugins,
        })
    }

    /// The verified debugger endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Tunnels and router.
    #[must_use]
    pub fn service(&self) -> &TunnelService {
        &self.service
    }

    /// Plugin host.
    #[must_use]
    pub fn plugins(&self) -> &RuntimeManager {
        &self.plugins
    }

    /// Block until `shutdown` is set.
    pub fn run_until(&self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(SHUTDOWN_POLL);
        }
    }

    /// Unload plugins, then stop the tunnels.
    pub fn shutdown(self) {
        for (name, outcome) in self.plugins.unload_all() {
            if outcome == UnloadOutcome::TimedOut {
                log::warn!("[Bootstrap] Plugin [{}] left running after timeout", name);
            }
        }
        self.service.shutdown();
        log::info!("[Bootstrap] Shut down session {}", self.service.session_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::probe::PermissiveProbe;
    use crate::endpoint::{ListenerProbe, ProcessIdentity};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct OwnedBy(&'static str);

    impl ListenerProbe for OwnedBy {
        fn find_listener_owner(&self, _port: u16) -> Option<ProcessIdentity> {
            Some(ProcessIdentity {
                pid: 4242,
                executable: PathBuf::from(self.0),
            })
        }
    }

    fn resolver(server: &MockServer, probe: Box<dyn ListenerProbe>) -> EndpointResolver {
        let addr = server.address();
        EndpointResolver::new(
            vec![format!("-devtools-port={}", addr.port())],
            addr.ip().to_string(),
            "steamwebhelper",
            probe,
        )
    }

    async fn version_server(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({
                "Browser": "Chrome/126.0",
                "webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/browser/x"
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_check_reports_browser() {
        let server = version_server(200).await;
        let resolver = resolver(&server, Box::new(PermissiveProbe));

        let report = tokio::task::spawn_blocking(move || check_with(&resolver))
            .await
            .expect("join")
            .expect("check");

        assert_eq!(report.verdict, SafetyVerdict::Unchecked);
        assert_eq!(report.browser.as_deref(), Some("Chrome/126.0"));
        assert_eq!(report.ws_url, "ws://127.0.0.1:1/devtools/browser/x");
    }

    #[tokio::test]
    async fn test_wrong_owner_is_fatal() {
        let server = version_server(200).await;
        let resolver = resolver(&server, Box::new(OwnedBy("/usr/bin/nc")));

        let err = tokio::task::spawn_blocking(move || Host::start_with(&Config::default(), &resolver))
            .await
            .expect("join")
            .expect_err("must refuse");

        assert!(matches!(err, BootstrapError::Endpoint(ResolveError::WrongOwner { .. })));
        assert!(err.to_string().contains("/usr/bin/nc"));
    }

    #[tokio::test]
    async fn test_discovery_failure_is_fatal() {
        let server = version_server(503).await;
        let resolver = resolver(&server, Box::new(PermissiveProbe));

        let err = tokio::task::spawn_blocking(move || Host::start_with(&Config::default(), &resolver))
            .await
            .expect("join")
            .expect_err("must fail");

        assert!(matches!(err, BootstrapError::Discovery { .. }));
    }

    #[test]
    fn test_update_modules_reports_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            plugins_dir: dir.path().to_path_buf(),
            modules: vec![crate::config::ModuleMirror {
                path: PathBuf::from("missing"),
                remote: dir.path().join("no-remote").to_string_lossy().to_string(),
            }],
            ..Config::default()
        };

        assert_eq!(update_modules(&config), vec![(dir.path().join("missing"), false)]);
    }
}
