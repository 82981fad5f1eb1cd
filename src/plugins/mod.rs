//! Multi-runtime plugin host.
//!
//! [`RuntimeManager`] keeps one [`PluginContext`] per plugin name. Each
//! context is an OS thread named `plugin-<name>` that owns its own Lua
//! state (see [`context`]); plugins share nothing but the message bus and
//! the log sink.
//!
//! # Locking
//!
//! The context map sits behind a `Mutex` that only load and unload take.
//! Attribution lookups go through the separate [`ThreadRegistry`] `RwLock`
//! and never contend with it.
//!
//! A context whose unload timed out moves to a separate stopping map and
//! keeps its name reserved until its thread exits. Lock order is contexts,
//! then stopping.

// Rust guideline compliant 2026-02

pub mod attribution;
mod context;
pub mod manifest;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::lua::GuestEnv;
use crate::router::MessageBus;
use crate::sink::LogSink;

pub use attribution::{ThreadRegistry, UNKNOWN_PLUGIN};
pub use context::InboxEvent;
pub use manifest::PluginManifest;

/// Default bound on how long `unload` waits for a plugin thread.
pub const DEFAULT_UNLOAD_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PluginStatus {
    /// Thread started, entry code not finished.
    Loading = 0,
    /// Entry code and `on_load` succeeded.
    Running = 1,
    /// Thread finished after a stop request.
    Stopped = 2,
    /// Loading failed or the thread died.
    Failed = 3,
}

impl From<u8> for PluginStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => PluginStatus::Loading,
            1 => PluginStatus::Running,
            2 => PluginStatus::Stopped,
            _ => PluginStatus::Failed,
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginStatus::Loading => "loading",
            PluginStatus::Running => "running",
            PluginStatus::Stopped => "stopped",
            PluginStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a plugin runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEntry {
    /// Inline source, mostly for tests and embedding.
    Source {
        /// Chunk name shown in Lua errors.
        name: String,
        /// Lua source.
        code: String,
    },
    /// Entry file; its directory joins `package.path`.
    File(PathBuf),
}

impl fmt::Display for PluginEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginEntry::Source { name, .. } => write!(f, "<{name}>"),
            PluginEntry::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Snapshot of one plugin.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: String,
    /// Current status.
    pub status: PluginStatus,
    /// When `load` was called.
    pub loaded_at: DateTime<Utc>,
    /// Entry description.
    pub source: String,
}

/// Load failures.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// A context with this name is loading or running.
    #[error("plugin '{0}' is already loaded")]
    AlreadyLoaded(String),
    /// A detached context with this name has not exited yet.
    #[error("plugin '{0}' is still stopping")]
    StillStopping(String),
    /// The OS refused to create the plugin thread.
    #[error("failed to spawn thread for plugin '{name}': {source}")]
    Spawn {
        /// Plugin name.
        name: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Result of [`RuntimeManager::unload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// The thread finished within the timeout.
    Stopped,
    /// The thread did not finish in time. The name stays reserved until
    /// it exits.
    TimedOut,
    /// No plugin with that name.
    NotLoaded,
}

/// Tunables for the plugin host.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Bound on the join performed by `unload`.
    pub unload_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            unload_timeout: DEFAULT_UNLOAD_TIMEOUT,
        }
    }
}

/// One live plugin.
pub struct PluginContext {
    name: String,
    source: String,
    loaded_at: DateTime<Utc>,
    status: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    inbox: Sender<InboxEvent>,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    fn status(&self) -> PluginStatus {
        PluginStatus::from(self.status.load(Ordering::Acquire))
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            status: self.status(),
            loaded_at: self.loaded_at,
            source: self.source.clone(),
        }
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        // The thread may already have exited
        let _ = self.inbox.send(InboxEvent::Stop);
    }

    fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the thread. On timeout the handle stays in
    /// place so the caller can park the context.
    fn join(&mut self, timeout: Duration) -> UnloadOutcome {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "[Plugins] [{}] did not stop within {:?}; detaching its thread",
                    self.name,
                    timeout
                );
                return UnloadOutcome::TimedOut;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("[Plugins] [{}] thread panicked", self.name);
            }
        }
        UnloadOutcome::Stopped
    }
}

/// Registry of plugin contexts.
pub struct RuntimeManager {
    contexts: Mutex<HashMap<String, PluginContext>>,
    stopping: Mutex<HashMap<String, PluginContext>>,
    registry: Arc<ThreadRegistry>,
    bus: Arc<dyn MessageBus>,
    sink: Arc<dyn LogSink>,
    options: RuntimeOptions,
}

impl fmt::Debug for RuntimeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeManager")
            .field("plugins", &self.plugins())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RuntimeManager {
    /// Create an empty manager.
    pub fn new(bus: Arc<dyn MessageBus>, sink: Arc<dyn LogSink>, options: RuntimeOptions) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            stopping: Mutex::new(HashMap::new()),
            registry: Arc::new(ThreadRegistry::new()),
            bus,
            sink,
            options,
        }
    }

    fn contexts(&self) -> std::sync::MutexGuard<'_, HashMap<String, PluginContext>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stopping(&self) -> std::sync::MutexGuard<'_, HashMap<String, PluginContext>> {
        self.stopping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join a context, parking it in the stopping map if it overruns.
    fn finish(&self, mut context: PluginContext) -> UnloadOutcome {
        let outcome = context.join(self.options.unload_timeout);
        if outcome == UnloadOutcome::TimedOut {
            self.stopping().insert(context.name.clone(), context);
        }
        outcome
    }

    /// Whether a timed-out context still holds `name`. Reaps it once its
    /// thread has exited.
    fn still_stopping(&self, name: &str) -> bool {
        let mut stopping = self.stopping();
        match stopping.get(name).map(PluginContext::is_finished) {
            None => false,
            Some(false) => true,
            Some(true) => {
                if let Some(mut old) = stopping.remove(name) {
                    old.join(Duration::ZERO);
                    log::debug!("[Plugins] [{}] detached thread has exited", name);
                }
                false
            }
        }
    }

    /// The attribution registry shared by every plugin thread.
    pub fn registry(&self) -> Arc<ThreadRegistry> {
        Arc::clone(&self.registry)
    }

    /// Start a plugin.
    ///
    /// Returns as soon as the thread is spawned; use
    /// [`Self::wait_until_settled`] to observe the outcome. Entry errors
    /// never surface here: they turn the plugin `Failed` and go to the sink.
    pub fn load(&self, name: &str, entry: PluginEntry) -> Result<PluginInfo, LoadError> {
        let mut contexts = self.contexts();

        if let Some(existing) = contexts.get(name) {
            if matches!(existing.status(), PluginStatus::Loading | PluginStatus::Running) {
                return Err(LoadError::AlreadyLoaded(name.to_string()));
            }
            if let Some(leftover) = contexts.remove(name) {
                log::debug!("[Plugins] Replacing {} context of [{}]", leftover.status(), name);
                self.finish(leftover);
            }
        }
        if self.still_stopping(name) {
            return Err(LoadError::StillStopping(name.to_string()));
        }

        let (inbox, inbox_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let status = Arc::new(AtomicU8::new(PluginStatus::Loading as u8));

        let env = GuestEnv {
            plugin: Arc::from(name),
            bus: Arc::clone(&self.bus),
            sink: Arc::clone(&self.sink),
            registry: Arc::clone(&self.registry),
            inbox: inbox.clone(),
            stop: Arc::clone(&stop),
        };

        let source = entry.to_string();
        let thread_status = Arc::clone(&status);
        let thread = std::thread::Builder::new()
            .name(format!("plugin-{name}"))
            .spawn(move || context::run(env, entry, inbox_rx, thread_status))
            .map_err(|source| LoadError::Spawn {
                name: name.to_string(),
                source,
            })?;

        let context = PluginContext {
            name: name.to_string(),
            source,
            loaded_at: Utc::now(),
            status,
            stop,
            inbox,
            thread: Some(thread),
        };
        let info = context.info();
        contexts.insert(name.to_string(), context);

        log::info!("[Plugins] Loading [{}] from {}", name, info.source);
        Ok(info)
    }

    /// Stop a plugin and wait (bounded) for its thread.
    pub fn unload(&self, name: &str) -> UnloadOutcome {
        let Some(context) = self.contexts().remove(name) else {
            return UnloadOutcome::NotLoaded;
        };

        context.request_stop();
        let outcome = self.finish(context);
        log::info!("[Plugins] Unloaded [{}] ({:?})", name, outcome);
        outcome
    }

    /// Unload then load again.
    pub fn reload(&self, name: &str, entry: PluginEntry) -> Result<PluginInfo, LoadError> {
        self.unload(name);
        self.load(name, entry)
    }

    /// Unload every plugin. Stop requests go out first so threads wind
    /// down in parallel.
    pub fn unload_all(&self) -> Vec<(String, UnloadOutcome)> {
        let drained: Vec<PluginContext> = self.contexts().drain().map(|(_, c)| c).collect();

        for context in &drained {
            context.request_stop();
        }

        let mut outcomes: Vec<(String, UnloadOutcome)> = drained
            .into_iter()
            .map(|context| {
                let name = context.name.clone();
                (name, self.finish(context))
            })
            .collect();
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    /// Current status of `name`.
    pub fn status(&self, name: &str) -> Option<PluginStatus> {
        self.contexts().get(name).map(PluginContext::status)
    }

    /// Snapshot of every plugin, sorted by name.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self.contexts().values().map(PluginContext::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Wait until `name` leaves `Loading`. Returns the status reached, or
    /// `Loading` on timeout, or `None` if no such plugin.
    pub fn wait_until_settled(&self, name: &str, timeout: Duration) -> Option<PluginStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status(name)?;
            if status != PluginStatus::Loading || Instant::now() >= deadline {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Plugin currently executing on `thread`, or [`UNKNOWN_PLUGIN`].
    pub fn resolve_current_owner(&self, thread: ThreadId) -> String {
        self.registry.resolve(thread)
    }
}

impl Drop for RuntimeManager {
    fn drop(&mut self) {
        for context in self.contexts().values().chain(self.stopping().values()) {
            context.request_stop();
        }
    }
}
