//! Self-healing tunnel to the host debugger.
//!
//! A [`TunnelConnection`] owns one physical connection at a time and keeps
//! re-establishing it until shutdown. The host restarts its browser process
//! routinely, so every transport failure is treated as a disconnect and
//! retried; nothing here is fatal.
//!
//! # Threading Model
//!
//! [`TunnelConnection::connect_and_run`] blocks. It is meant to run on a
//! dedicated OS thread and builds its own current-thread tokio runtime.
//! Outbound frames reach the loop through an
//! unbounded channel owned by the [`ConnectionHandle`], so any thread can
//! send without touching the runtime.
//!
//! ```text
//!  url_provider() ──► Transport::connect ──► on_open
//!        ▲                                      │
//!        │                               select! loop
//!     backoff ◄── on_close ◄── close/error ◄────┘
//! ```

// Rust guideline compliant 2026-02

mod transport;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ws::WsMessage;

pub use transport::{Link, LinkReader, LinkWriter, Transport};

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(50);

/// Tunnel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No connection.
    Disconnected = 0,
    /// Resolving the URL or performing the handshake.
    Connecting = 1,
    /// Connection established.
    Connected = 2,
    /// Shutdown requested, close frame in flight.
    Closing = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// How long to wait between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay every time.
    Fixed(Duration),
    /// Doubling delay after consecutive failures, capped at `max`.
    /// Resets once a connection is established.
    Exponential {
        /// First delay.
        initial: Duration,
        /// Upper bound.
        max: Duration,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Delay after `consecutive_failures` failed attempts in a row.
    #[must_use]
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let shift = consecutive_failures.saturating_sub(1).min(16);
                initial.saturating_mul(1 << shift).min(max)
            }
        }
    }
}

/// Tunnel behaviour knobs.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Keep reconnecting after a disconnect.
    pub auto_reconnect: bool,
    /// Delay between attempts.
    pub reconnect: ReconnectPolicy,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Why [`TunnelConnection::connect_and_run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelExit {
    /// Shutdown was requested.
    Shutdown,
    /// Disconnected with auto-reconnect disabled.
    Disconnected,
}

/// Handle to one established connection.
///
/// Cheap to clone. Becomes inert once its connection closes: sends return
/// `false` instead of being queued for a future connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    name: String,
    id: u64,
    open: AtomicBool,
    tx: mpsc::UnboundedSender<String>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ConnectionHandle {
    /// Create a handle and the receiver its frames are queued on.
    pub fn channel(name: impl Into<String>, id: u64) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            inner: Arc::new(HandleInner {
                name: name.into(),
                id,
                open: AtomicBool::new(true),
                tx,
            }),
        };
        (handle, rx)
    }

    /// Tunnel name this connection belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Per-tunnel session number.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the connection is still up.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Queue a text frame. Returns `false` if the connection is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.is_open() && self.inner.tx.send(text).is_ok()
    }

    /// Mark the connection closed.
    pub fn close(&self) {
        self.inner.open.store(false, Ordering::Release);
    }

    /// Whether two handles refer to the same session.
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Receives connection lifecycle events.
///
/// Called on the tunnel thread; implementations must not block.
pub trait TunnelHandler: Send + Sync {
    /// A connection was established.
    fn on_open(&self, connection: &ConnectionHandle);

    /// A text frame arrived.
    fn on_message(&self, connection: &ConnectionHandle, text: &str);

    /// The connection closed. The handle is already inert.
    fn on_close(&self, _connection: &ConnectionHandle) {}
}

/// How a single session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionOutcome {
    /// Never connected.
    Failed,
    /// Connected, then closed or errored.
    Closed,
    /// Shutdown requested.
    Shutdown,
}

/// One auto-reconnecting tunnel.
pub struct TunnelConnection<T: Transport> {
    name: String,
    transport: T,
    options: TunnelOptions,
    state: AtomicU8,
    attempts: AtomicU64,
    sessions: AtomicU64,
    shutdown: CancellationToken,
}

impl<T: Transport> std::fmt::Debug for TunnelConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> TunnelConnection<T> {
    /// Create a tunnel. Nothing connects until [`Self::connect_and_run`].
    pub fn new(
        name: impl Into<String>,
        transport: T,
        options: TunnelOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            options,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            attempts: AtomicU64::new(0),
            sessions: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Tunnel name used in logs and routing.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Number of transport connects attempted so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Run the connect/dispatch/reconnect loop until shutdown.
    ///
    /// `url_provider` is called before every attempt; an error from it is
    /// treated like a failed connect. Returns `Err` only if the thread's
    /// tokio runtime cannot be built.
    pub fn connect_and_run<U>(&self, mut url_provider: U, handler: &dyn TunnelHandler) -> Result<TunnelExit>
    where
        U: FnMut() -> Result<String>,
    {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create tunnel runtime")?;

        let mut consecutive_failures: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(TunnelExit::Shutdown);
            }

            self.set_state(ConnectionState::Connecting);
            let outcome = match url_provider() {
                Ok(url) => rt.block_on(self.run_session(&url, handler)),
                Err(e) => {
                    log::warn!("[Tunnel] Could not resolve URL for [{}]: {e:#}", self.name);
                    SessionOutcome::Failed
                }
            };
            self.set_state(ConnectionState::Disconnected);

            match outcome {
                SessionOutcome::Shutdown => return Ok(TunnelExit::Shutdown),
                SessionOutcome::Closed => consecutive_failures = 0,
                SessionOutcome::Failed => consecutive_failures = consecutive_failures.saturating_add(1),
            }

            log::info!("[Tunnel] Disconnected from [{}]", self.name);

            if !self.options.auto_reconnect {
                return Ok(TunnelExit::Disconnected);
            }

            let delay = self.options.reconnect.delay(consecutive_failures.max(1));
            let cancelled = rt.block_on(async {
                tokio::select! {
                    () = tokio::time::sleep(delay) => false,
                    () = self.shutdown.cancelled() => true,
                }
            });
            if cancelled {
                return Ok(TunnelExit::Shutdown);
            }
        }
    }

    async fn run_session(&self, url: &str, handler: &dyn TunnelHandler) -> SessionOutcome {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let link = tokio::select! {
            result = self.transport.connect(url) => match result {
                Ok(link) => link,
                Err(e) => {
                    log::warn!("[Tunnel] Connect to [{}] failed: {e:#}", self.name);
                    return SessionOutcome::Failed;
                }
            },
            () = self.shutdown.cancelled() => return SessionOutcome::Shutdown,
        };
        let Link { mut writer, mut reader } = link;

        let session = self.sessions.fetch_add(1, Ordering::SeqCst);
        let (handle, mut outbound) = ConnectionHandle::channel(self.name.clone(), session);

        self.set_state(ConnectionState::Connected);
        log::info!("[Tunnel] Connected to [{}] at {}", self.name, url);
        handler.on_open(&handle);

        let outcome = loop {
            tokio::select! {
                frame = reader.recv() => match frame {
                    Some(Ok(WsMessage::Text(text))) => handler.on_message(&handle, &text),
                    Some(Ok(WsMessage::Binary(data))) => {
                        handler.on_message(&handle, &String::from_utf8_lossy(&data));
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = writer.send_pong(data).await {
                            log::warn!("[Tunnel] Failed to send pong on [{}]: {e:#}", self.name);
                            break SessionOutcome::Closed;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[Tunnel] [{}] closed by host ({code}: {reason})", self.name);
                        break SessionOutcome::Closed;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Tunnel] [{}] transport error: {e:#}", self.name);
                        break SessionOutcome::Closed;
                    }
                    None => {
                        log::info!("[Tunnel] [{}] stream ended", self.name);
                        break SessionOutcome::Closed;
                    }
                },
                Some(text) = outbound.recv() => {
                    if let Err(e) = writer.send_text(&text).await {
                        log::warn!("[Tunnel] Send on [{}] failed: {e:#}", self.name);
                        break SessionOutcome::Closed;
                    }
                }
                () = self.shutdown.cancelled() => {
                    self.set_state(ConnectionState::Closing);
                    if let Err(e) = writer.send_close().await {
                        log::debug!("[Tunnel] Close on [{}] failed: {e:#}", self.name);
                    }
                    break SessionOutcome::Shutdown;
                }
            }
        };

        handle.close();
        handler.on_close(&handle);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Reader fed by the test through a channel.
    struct ScriptedReader {
        rx: mpsc::UnboundedReceiver<WsMessage>,
    }

    #[async_trait]
    impl LinkReader for ScriptedReader {
        async fn recv(&mut self) -> Option<Result<WsMessage>> {
            self.rx.recv().await.map(Ok)
        }
    }

    /// Writer recording every frame.
    struct RecordingWriter {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LinkWriter for RecordingWriter {
        async fn send_text(&mut self, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_pong(&mut self, _data: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn send_close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Fails the first `fail_first` connects, then hands out scripted links.
    struct FlakyTransport {
        fail_first: usize,
        connects: AtomicUsize,
        scripts: Mutex<VecDeque<mpsc::UnboundedReceiver<WsMessage>>>,
        idle_senders: Mutex<Vec<mpsc::UnboundedSender<WsMessage>>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl FlakyTransport {
        fn new(fail_first: usize) -> Self {
            Self {
                fail_first,
                connects: AtomicUsize::new(0),
                scripts: Mutex::new(VecDeque::new()),
                idle_senders: Mutex::new(Vec::new()),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Queue a session whose inbound frames the test controls.
        fn script(&self) -> mpsc::UnboundedSender<WsMessage> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scripts.lock().unwrap().push_back(rx);
            tx
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn connect(&self, _url: &str) -> Result<Link> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("connection refused (attempt {n})");
            }

            let rx = self.scripts.lock().unwrap().pop_front().unwrap_or_else(|| {
                // Unscripted sessions stay open until shutdown
                let (tx, rx) = mpsc::unbounded_channel();
                self.idle_senders.lock().unwrap().push(tx);
                rx
            });

            Ok(Link {
                writer: Box::new(RecordingWriter {
                    sent: Arc::clone(&self.sent),
                }),
                reader: Box::new(ScriptedReader { rx }),
            })
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        opens: AtomicUsize,
        closes: AtomicUsize,
        messages: Mutex<Vec<String>>,
        last_handle: Mutex<Option<ConnectionHandle>>,
    }

    impl TunnelHandler for RecordingHandler {
        fn on_open(&self, connection: &ConnectionHandle) {
            self.opens.fetch_add(1, Ordering::SeqCst);
            *self.last_handle.lock().unwrap() = Some(connection.clone());
        }

        fn on_message(&self, _connection: &ConnectionHandle, text: &str) {
            self.messages.lock().unwrap().push(text.to_string());
        }

        fn on_close(&self, _connection: &ConnectionHandle) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn options(auto_reconnect: bool, delay_ms: u64) -> TunnelOptions {
        TunnelOptions {
            auto_reconnect,
            reconnect: ReconnectPolicy::Fixed(Duration::from_millis(delay_ms)),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_connection_state_from_u8() {
        assert_eq!(ConnectionState::from(0), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::from(1), ConnectionState::Connecting);
        assert_eq!(ConnectionState::from(2), ConnectionState::Connected);
        assert_eq!(ConnectionState::from(3), ConnectionState::Closing);
        assert_eq!(ConnectionState::from(200), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reconnect_policy_delays() {
        let fixed = ReconnectPolicy::Fixed(Duration::from_millis(50));
        assert_eq!(fixed.delay(1), Duration::from_millis(50));
        assert_eq!(fixed.delay(100), Duration::from_millis(50));

        let exp = ReconnectPolicy::Exponential {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(1000),
        };
        assert_eq!(exp.delay(0), Duration::from_millis(50));
        assert_eq!(exp.delay(1), Duration::from_millis(50));
        assert_eq!(exp.delay(2), Duration::from_millis(100));
        assert_eq!(exp.delay(3), Duration::from_millis(200));
        assert_eq!(exp.delay(6), Duration::from_millis(1000));
        assert_eq!(exp.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_n_failures_then_success() {
        const FAILURES: usize = 3;
        const DELAY_MS: u64 = 20;

        let token = CancellationToken::new();
        let tunnel = Arc::new(TunnelConnection::new(
            "browser",
            FlakyTransport::new(FAILURES),
            options(true, DELAY_MS),
            token.clone(),
        ));
        let handler = Arc::new(RecordingHandler::default());

        let start = Instant::now();
        let thread = {
            let tunnel = Arc::clone(&tunnel);
            let handler = Arc::clone(&handler);
            std::thread::spawn(move || {
                tunnel.connect_and_run(|| Ok("ws://host/devtools".to_string()), handler.as_ref())
            })
        };

        wait_for(|| handler.opens.load(Ordering::SeqCst) == 1);
        let elapsed = start.elapsed();

        assert_eq!(tunnel.attempts(), (FAILURES + 1) as u64);
        assert!(
            elapsed >= Duration::from_millis(DELAY_MS * FAILURES as u64),
            "backoff not observed: {elapsed:?}"
        );
        assert_eq!(tunnel.state(), ConnectionState::Connected);

        // Stays connected: no further attempts, no second on_open
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(handler.opens.load(Ordering::SeqCst), 1);
        assert_eq!(tunnel.attempts(), (FAILURES + 1) as u64);

        token.cancel();
        let exit = thread.join().expect("join").expect("runtime");
        assert_eq!(exit, TunnelExit::Shutdown);
        assert_eq!(tunnel.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_no_auto_reconnect_returns_after_disconnect() {
        let transport = FlakyTransport::new(0);
        let script = transport.script();
        script
            .send(WsMessage::Close {
                code: 1000,
                reason: "bye".to_string(),
            })
            .unwrap();

        let tunnel = TunnelConnection::new("browser", transport, options(false, 10), CancellationToken::new());
        let handler = RecordingHandler::default();

        let exit = tunnel
            .connect_and_run(|| Ok("ws://host".to_string()), &handler)
            .expect("runtime");

        assert_eq!(exit, TunnelExit::Disconnected);
        assert_eq!(tunnel.attempts(), 1);
        assert_eq!(handler.opens.load(Ordering::SeqCst), 1);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_auto_reconnect_returns_after_failed_connect() {
        let tunnel = TunnelConnection::new(
            "browser",
            FlakyTransport::new(usize::MAX),
            options(false, 10),
            CancellationToken::new(),
        );
        let handler = RecordingHandler::default();

        let exit = tunnel
            .connect_and_run(|| Ok("ws://host".to_string()), &handler)
            .expect("runtime");

        assert_eq!(exit, TunnelExit::Disconnected);
        assert_eq!(handler.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_frames_dispatched_in_order_and_outbound_sent() {
        let transport = FlakyTransport::new(0);
        let script = transport.script();
        let sent = Arc::clone(&transport.sent);

        let token = CancellationToken::new();
        let tunnel = Arc::new(TunnelConnection::new("browser", transport, options(true, 10), token.clone()));
        let handler = Arc::new(RecordingHandler::default());

        let thread = {
            let tunnel = Arc::clone(&tunnel);
            let handler = Arc::clone(&handler);
            std::thread::spawn(move || tunnel.connect_and_run(|| Ok("ws://host".to_string()), handler.as_ref()))
        };

        wait_for(|| handler.opens.load(Ordering::SeqCst) == 1);
        script.send(WsMessage::Text("a".to_string())).unwrap();
        script.send(WsMessage::Binary(b"b".to_vec())).unwrap();
        script.send(WsMessage::Text("c".to_string())).unwrap();
        wait_for(|| handler.messages.lock().unwrap().len() == 3);
        assert_eq!(*handler.messages.lock().unwrap(), vec!["a", "b", "c"]);

        let handle = handler.last_handle.lock().unwrap().clone().expect("handle");
        assert!(handle.send_text("one".to_string()));
        assert!(handle.send_text("two".to_string()));
        wait_for(|| sent.lock().unwrap().len() == 2);
        assert_eq!(*sent.lock().unwrap(), vec!["one", "two"]);

        token.cancel();
        assert_eq!(thread.join().expect("join").expect("runtime"), TunnelExit::Shutdown);

        // The handle of a closed session never queues again
        assert!(!handle.is_open());
        assert!(!handle.send_text("late".to_string()));
    }

    #[test]
    fn test_reconnects_after_remote_close() {
        let transport = FlakyTransport::new(0);
        let first = transport.script();

        let token = CancellationToken::new();
        let tunnel = Arc::new(TunnelConnection::new("browser", transport, options(true, 10), token.clone()));
        let handler = Arc::new(RecordingHandler::default());

        let thread = {
            let tunnel = Arc::clone(&tunnel);
            let handler = Arc::clone(&handler);
            std::thread::spawn(move || tunnel.connect_and_run(|| Ok("ws://host".to_string()), handler.as_ref()))
        };

        wait_for(|| handler.opens.load(Ordering::SeqCst) == 1);
        drop(first);
        wait_for(|| handler.opens.load(Ordering::SeqCst) == 2);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
        assert_eq!(tunnel.attempts(), 2);

        token.cancel();
        thread.join().expect("join").expect("runtime");
    }

    #[test]
    fn test_url_provider_failure_is_retried() {
        let token = CancellationToken::new();
        let tunnel = Arc::new(TunnelConnection::new(
            "shared",
            FlakyTransport::new(0),
            options(true, 5),
            token.clone(),
        ));
        let handler = Arc::new(RecordingHandler::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let thread = {
            let tunnel = Arc::clone(&tunnel);
            let handler = Arc::clone(&handler);
            let calls = Arc::clone(&calls);
            std::thread::spawn(move || {
                tunnel.connect_and_run(
                    move || {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            anyhow::bail!("target not published yet")
                        }
                        Ok("ws://host/page".to_string())
                    },
                    handler.as_ref(),
                )
            })
        };

        wait_for(|| handler.opens.load(Ordering::SeqCst) == 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(tunnel.attempts(), 1);

        token.cancel();
        thread.join().expect("join").expect("runtime");
    }

    #[test]
    fn test_shutdown_interrupts_backoff() {
        let token = CancellationToken::new();
        let tunnel = Arc::new(TunnelConnection::new(
            "browser",
            FlakyTransport::new(usize::MAX),
            options(true, 60_000),
            token.clone(),
        ));

        let thread = {
            let tunnel = Arc::clone(&tunnel);
            std::thread::spawn(move || {
                let handler = RecordingHandler::default();
                tunnel.connect_and_run(|| Ok("ws://host".to_string()), &handler)
            })
        };

        wait_for(|| tunnel.attempts() == 1);
        let start = Instant::now();
        token.cancel();
        let exit = thread.join().expect("join").expect("runtime");
        assert_eq!(exit, TunnelExit::Shutdown);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
