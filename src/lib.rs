//! cefhost - plugin loader for an embedded Chromium host.
//!
//! Attaches to the host's DevTools debugger, keeps auto-reconnecting
//! tunnels to it, and runs Lua plugins in isolated runtimes whose output is
//! attributed back to the plugin that produced it.
//!
//! # Architecture
//!
//! - **Endpoint** - where the debugger listens, and whether it is safe to attach
//! - **Tunnel** - one reconnecting websocket per debugger target
//! - **Router** - global/shared delivery and dispatch by message identifier
//! - **Plugins** - one OS thread and one Lua state per plugin
//!
//! # Modules
//!
//! - [`endpoint`] - port resolution and listener ownership check
//! - [`discovery`] - `/json/version` and `/json` lookups
//! - [`tunnel`] - connection loop and transport seam
//! - [`router`] - message bus used by plugins
//! - [`plugins`] - runtime manager, attribution, manifests
//! - [`lua`] - guest runtime, primitives, output redirection
//! - [`config`] - configuration loading
//! - [`bootstrap`] - startup and shutdown

// Library modules
pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod lua;
pub mod plugins;
pub mod router;
pub mod service;
pub mod sink;
pub mod tunnel;
pub mod updater;
pub mod ws;

// Re-export commonly used types
pub use bootstrap::{BootstrapError, Host};
pub use config::Config;
pub use plugins::{PluginEntry, PluginStatus, RuntimeManager};
pub use router::{MessageBus, MessageRouter};
pub use service::TunnelService;
