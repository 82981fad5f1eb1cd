//! Body of a plugin thread.
//!
//! ```text
//! Loading ──entry + on_load ok──► Running ──Stop / stop flag──► on_unload ──► Stopped
//!    │                                                                         ▲
//!    └──error──► Failed                      stop requested while loading ─────┘
//! ```
//!
//! The thread owns the plugin's Lua state from creation to drop. Guest code
//! only runs under an [`ExecutionTag`](super::attribution::ExecutionTag) so
//! its output is attributed to the plugin.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::{PluginEntry, PluginStatus};
use crate::lua::{GuestEnv, GuestRuntime};

/// How long the inbox wait blocks before re-checking the stop flag.
const INBOX_POLL: Duration = Duration::from_millis(100);

/// Work delivered to a plugin thread.
#[derive(Debug, Clone)]
pub enum InboxEvent {
    /// Inbound tunnel message for a `tunnel.on` callback.
    Message {
        /// Callback id returned by `tunnel.on`.
        callback: u64,
        /// Decoded message.
        payload: serde_json::Value,
    },
    /// Leave the event loop and unload.
    Stop,
}

/// Build the state, run the entry code and `on_load`.
fn start(env: GuestEnv, entry: &PluginEntry) -> Result<GuestRuntime> {
    let runtime = GuestRuntime::new(env)?;
    match entry {
        PluginEntry::Source { name, code } => runtime.load_string(name, code)?,
        PluginEntry::File(path) => runtime.load_file(path)?,
    }
    runtime.call_lifecycle(crate::lua::ON_LOAD)?;
    Ok(runtime)
}

/// Run a plugin to completion on the current thread.
pub(crate) fn run(env: GuestEnv, entry: PluginEntry, inbox: Receiver<InboxEvent>, status: Arc<AtomicU8>) {
    let name = Arc::clone(&env.plugin);
    let registry = Arc::clone(&env.registry);
    let sink = Arc::clone(&env.sink);
    let bus = Arc::clone(&env.bus);
    let stop = Arc::clone(&env.stop);

    // Whatever happens below, leave no subscriptions and no in-between status
    let _cleanup = scopeguard::guard((), |()| {
        let removed = bus.unsubscribe_owner(&name);
        if removed > 0 {
            log::debug!("[Plugins] [{}] dropped {} subscription(s)", name, removed);
        }
        let current = PluginStatus::from(status.load(Ordering::Acquire));
        if matches!(current, PluginStatus::Loading | PluginStatus::Running) {
            status.store(PluginStatus::Failed as u8, Ordering::Release);
        }
    });

    let started = {
        let _tag = registry.tag_current(&name);
        start(env, &entry)
    };

    let runtime = match started {
        Ok(runtime) => runtime,
        Err(e) if stop.load(Ordering::Acquire) => {
            log::info!("[Plugins] [{}] stopped while loading: {e:#}", name);
            status.store(PluginStatus::Stopped as u8, Ordering::Release);
            return;
        }
        Err(e) => {
            sink.log_error(&name, &format!("failed to load {entry}: {e:#}"));
            status.store(PluginStatus::Failed as u8, Ordering::Release);
            return;
        }
    };

    status.store(PluginStatus::Running as u8, Ordering::Release);
    log::info!("[Plugins] [{}] running", name);

    while !stop.load(Ordering::Acquire) {
        match inbox.recv_timeout(INBOX_POLL) {
            Ok(InboxEvent::Message { callback, payload }) => {
                let _tag = registry.tag_current(&name);
                if let Err(e) = runtime.dispatch(callback, &payload) {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    sink.log_error(&name, &format!("{e:#}"));
                }
            }
            Ok(InboxEvent::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    {
        let _tag = registry.tag_current(&name);
        if let Err(e) = runtime.run_unload() {
            sink.log_error(&name, &format!("{e:#}"));
        }
    }
    drop(runtime);

    status.store(PluginStatus::Stopped as u8, Ordering::Release);
    log::info!("[Plugins] [{}] stopped", name);
}
