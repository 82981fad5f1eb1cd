//! Owner of the tunnels and their shared router.
//!
//! Built once by the bootstrap and passed down explicitly; nothing in the
//! crate reaches it through a global.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::router::{MessageBus, MessageRouter};
use crate::tunnel::{Transport, TunnelConnection, TunnelOptions};

/// Running tunnels plus the router they feed.
pub struct TunnelService {
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
    session_id: String,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl std::fmt::Debug for TunnelService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelService")
            .field("session_id", &self.session_id)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl TunnelService {
    /// Create a service whose shared posts go to the tunnel named `primary`.
    pub fn new(primary: impl Into<String>) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        log::info!("[TunnelService] Session {}", session_id);
        Self {
            router: Arc::new(MessageRouter::new(primary)),
            shutdown: CancellationToken::new(),
            session_id,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// The shared router.
    pub fn router(&self) -> Arc<MessageRouter> {
        Arc::clone(&self.router)
    }

    /// The router as the plugin-facing bus.
    pub fn bus(&self) -> Arc<dyn MessageBus> {
        Arc::clone(&self.router) as Arc<dyn MessageBus>
    }

    /// Random id of this process run, for correlating logs.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Start a tunnel on its own thread.
    ///
    /// `url_provider` is re-evaluated before every connect attempt, so it
    /// should rediscover the websocket URL rather than return a cached one.
    pub fn spawn<T, U>(&self, name: &str, transport: T, options: TunnelOptions, url_provider: U) -> Result<()>
    where
        T: Transport + 'static,
        U: FnMut() -> Result<String> + Send + 'static,
    {
        let tunnel = TunnelConnection::new(name, transport, options, self.shutdown.clone());
        let router = Arc::clone(&self.router);
        let tunnel_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(format!("tunnel-{name}"))
            .spawn(move || match tunnel.connect_and_run(url_provider, router.as_ref()) {
                Ok(exit) => log::info!("[TunnelService] Tunnel [{}] exited ({:?})", tunnel_name, exit),
                Err(e) => log::error!("[TunnelService] Tunnel [{}] failed: {e:#}", tunnel_name),
            })
            .with_context(|| format!("Failed to spawn tunnel thread for [{name}]"))?;

        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), handle));
        Ok(())
    }

    /// Block until any tunnel is connected or `timeout` elapses.
    pub fn wait_until_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.router.is_connected() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Cancel every tunnel and join its thread.
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for (name, handle) in threads {
            if handle.join().is_err() {
                log::error!("[TunnelService] Tunnel thread [{}] panicked", name);
            }
        }
    }
}

impl Drop for TunnelService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{Link, ReconnectPolicy};
    use crate::ws::WsTransport;
    use futures_util::StreamExt;
    use serde_json::json;

    struct RefusingTransport;

    #[async_trait::async_trait]
    impl Transport for RefusingTransport {
        async fn connect(&self, _url: &str) -> Result<Link> {
            anyhow::bail!("connection refused")
        }
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = TunnelService::new("browser");
        let b = TunnelService::new("browser");
        assert_ne!(a.session_id(), b.session_id());
        assert_eq!(a.session_id().len(), 36);
    }

    #[test]
    fn test_shutdown_joins_retrying_tunnel() {
        let service = TunnelService::new("browser");
        service
            .spawn(
                "browser",
                RefusingTransport,
                TunnelOptions {
                    auto_reconnect: true,
                    reconnect: ReconnectPolicy::Fixed(Duration::from_secs(30)),
                },
                || Ok("ws://127.0.0.1:1/".to_string()),
            )
            .expect("spawn");

        assert!(!service.wait_until_connected(Duration::from_millis(50)));

        let start = Instant::now();
        service.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_posts_reach_local_websocket_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
            while let Some(Ok(msg)) = ws.next().await {
                if let Ok(text) = msg.to_text() {
                    let _ = seen_tx.send(text.to_string());
                }
            }
        });

        let service = Arc::new(TunnelService::new("browser"));
        let url = format!("ws://{addr}/devtools/browser/test");
        service
            .spawn("browser", WsTransport, TunnelOptions::default(), move || Ok(url.clone()))
            .expect("spawn");

        let waiter = Arc::clone(&service);
        let connected = tokio::task::spawn_blocking(move || waiter.wait_until_connected(Duration::from_secs(5)))
            .await
            .expect("join");
        assert!(connected);

        assert!(service.bus().post_global(&json!({"type": "hello"})));
        let frame = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("frame in time")
            .expect("frame");
        assert_eq!(frame, r#"{"type":"hello"}"#);

        let stopper = Arc::clone(&service);
        tokio::task::spawn_blocking(move || stopper.shutdown()).await.expect("join");
    }
}
