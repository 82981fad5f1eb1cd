//! `plugin` table: identity and cooperative scheduling.
//!
//! ```lua
//! log.info("I am " .. plugin.name)
//! while not plugin.stopping() do
//!     tunnel.post_global({ type = "heartbeat" })
//!     plugin.sleep(1000)
//! end
//! ```
//!
//! `plugin.sleep` wakes early and raises once the plugin is asked to stop,
//! so loops built on it unwind promptly on unload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use mlua::Lua;

use crate::lua::GuestEnv;

/// Granularity at which `plugin.sleep` checks the stop flag.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Error raised into guest code when it runs past a stop request.
pub(crate) fn stopping_error() -> mlua::Error {
    mlua::Error::RuntimeError("plugin is stopping".to_string())
}

/// Sleep for `duration`, returning `false` early if `stop` is set.
pub(crate) fn interruptible_sleep(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Register the `plugin` table.
pub fn register(lua: &Lua, env: &GuestEnv) -> Result<()> {
    let plugin_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create plugin table: {e}"))?;

    plugin_table
        .set("name", &*env.plugin)
        .map_err(|e| anyhow!("Failed to set plugin.name: {e}"))?;

    let stop = Arc::clone(&env.stop);
    let sleep_fn = lua
        .create_function(move |_, ms: u64| {
            if interruptible_sleep(Duration::from_millis(ms), &stop) {
                Ok(())
            } else {
                Err(stopping_error())
            }
        })
        .map_err(|e| anyhow!("Failed to create plugin.sleep function: {e}"))?;
    plugin_table
        .set("sleep", sleep_fn)
        .map_err(|e| anyhow!("Failed to set plugin.sleep: {e}"))?;

    let stop = Arc::clone(&env.stop);
    let stopping_fn = lua
        .create_function(move |_, ()| Ok(stop.load(Ordering::Acquire)))
        .map_err(|e| anyhow!("Failed to create plugin.stopping function: {e}"))?;
    plugin_table
        .set("stopping", stopping_fn)
        .map_err(|e| anyhow!("Failed to set plugin.stopping: {e}"))?;

    lua.globals()
        .set("plugin", plugin_table)
        .map_err(|e| anyhow!("Failed to register plugin table globally: {e}"))?;

    Ok(())
}
