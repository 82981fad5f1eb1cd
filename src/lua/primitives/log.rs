//! Logging primitive for plugin code.
//!
//! ```lua
//! log.info("ready")
//! log.warn("retrying")
//! log.error("giving up")
//! log.debug("payload: " .. json.encode(msg))
//! ```
//!
//! `info` and `error` go through the plugin's log sink, the same path as
//! `print` and `io.stderr`. `warn` and `debug` go straight to the `log`
//! facade under the plugin's `plugin::<name>` target.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::Lua;

use crate::lua::GuestEnv;

/// Register the `log` table.
pub fn register(lua: &Lua, env: &GuestEnv) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create log table: {e}"))?;

    let sink = Arc::clone(&env.sink);
    let plugin = Arc::clone(&env.plugin);
    let info_fn = lua
        .create_function(move |_, msg: String| {
            sink.log_plugin_message(&plugin, &msg);
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.info function: {e}"))?;

    let sink = Arc::clone(&env.sink);
    let plugin = Arc::clone(&env.plugin);
    let error_fn = lua
        .create_function(move |_, msg: String| {
            sink.log_error(&plugin, &msg);
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.error function: {e}"))?;

    let target = format!("plugin::{}", env.plugin);
    let plugin = Arc::clone(&env.plugin);
    let warn_fn = lua
        .create_function(move |_, msg: String| {
            log::warn!(target: target.as_str(), "[{plugin}] {msg}");
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.warn function: {e}"))?;

    let target = format!("plugin::{}", env.plugin);
    let plugin = Arc::clone(&env.plugin);
    let debug_fn = lua
        .create_function(move |_, msg: String| {
            log::debug!(target: target.as_str(), "[{plugin}] {msg}");
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.debug function: {e}"))?;

    for (name, function) in [("info", info_fn), ("warn", warn_fn), ("error", error_fn), ("debug", debug_fn)] {
        log_table
            .set(name, function)
            .map_err(|e| anyhow!("Failed to set log.{name}: {e}"))?;
    }

    lua.globals()
        .set("log", log_table)
        .map_err(|e| anyhow!("Failed to register log table globally: {e}"))?;

    Ok(())
}
