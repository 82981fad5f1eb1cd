//! Built-in globals exposed to plugin code.
//!
//! - `log` - attributed logging (info, warn, error, debug)
//! - `json` - JSON encode/decode
//! - `tunnel` - post_global, post_shared, on, off, connected
//! - `plugin` - name, sleep, stopping
//!
//! # Adding New Primitives
//!
//! 1. Create a new module (e.g., `foo.rs`)
//! 2. Implement `register(lua: &Lua, env: &GuestEnv) -> Result<()>`
//! 3. Add `pub mod foo;` here and call it from [`register_all`]

pub mod json;
pub mod log;
pub mod plugin;
pub mod tunnel;

use anyhow::Result;
use mlua::Lua;

use super::GuestEnv;

/// Register every primitive into a fresh guest state.
pub fn register_all(lua: &Lua, env: &GuestEnv) -> Result<()> {
    log::register(lua, env)?;
    json::register(lua)?;
    tunnel::register(lua, env)?;
    plugin::register(lua, env)?;
    Ok(())
}
