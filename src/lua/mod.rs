//! Guest Lua runtimes.
//!
//! Every plugin gets its own `mlua::Lua` state, created and dropped on the
//! plugin's thread. Nothing is shared between states except the Rust-side
//! handles collected in [`GuestEnv`].
//!
//! # Globals available to plugins
//!
//! - `log` - attributed logging (info, warn, error, debug)
//! - `json` - encode/decode
//! - `tunnel` - post to the host debugger and subscribe to inbound messages
//! - `plugin` - name, cooperative sleep, stop check
//! - `print`, `io.write`, `io.stdout`, `io.stderr` - redirected to the log sink

pub mod output;
pub mod primitives;
mod runtime;

use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Sender;
use std::sync::Arc;

pub use runtime::{GuestRuntime, HOOK_INTERVAL, ON_LOAD, ON_UNLOAD};

use crate::plugins::attribution::ThreadRegistry;
use crate::plugins::InboxEvent;
use crate::router::MessageBus;
use crate::sink::LogSink;

/// Handles a guest runtime needs from its host.
#[derive(Clone)]
pub struct GuestEnv {
    /// Plugin name.
    pub plugin: Arc<str>,
    /// Tunnel side.
    pub bus: Arc<dyn MessageBus>,
    /// Output destination.
    pub sink: Arc<dyn LogSink>,
    /// Thread attribution.
    pub registry: Arc<ThreadRegistry>,
    /// The plugin thread's inbox, fed by tunnel subscriptions.
    pub inbox: Sender<InboxEvent>,
    /// Set when the plugin should stop.
    pub stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for GuestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestEnv")
            .field("plugin", &self.plugin)
            .field("stop", &self.stop)
            .finish_non_exhaustive()
    }
}
