//! Per-plugin Lua state.
//!
//! A [`GuestRuntime`] owns one `mlua::Lua` with the primitives, the output
//! redirect and the stop hook installed. It is built on the plugin's thread
//! and never leaves it.
//!
//! # Stop hook
//!
//! An instruction-count hook fires every [`HOOK_INTERVAL`] VM instructions.
//! Once the plugin's stop flag is set the hook raises, which unwinds any
//! guest code stuck in a loop. Every [`YIELD_EVERY`] ticks the hook also
//! yields the OS thread so a busy plugin cannot starve the others.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use mlua::{Function, HookTriggers, Lua, Value};

use super::output::OutputRedirector;
use super::primitives::{self, json::json_to_lua, plugin::stopping_error, tunnel};
use super::GuestEnv;

/// VM instructions between stop-hook checks.
pub const HOOK_INTERVAL: u32 = 1_000;

/// Hook ticks between voluntary yields.
const YIELD_EVERY: u32 = 16;

/// Instruction budget for `on_unload`, which runs after stop is requested.
const UNLOAD_INSTRUCTION_BUDGET: u32 = 5_000_000;

/// Global called after the entry chunk ran.
pub const ON_LOAD: &str = "on_load";

/// Global called before the state is dropped.
pub const ON_UNLOAD: &str = "on_unload";

/// Lua state of one plugin.
pub struct GuestRuntime {
    lua: Lua,
    env: GuestEnv,
}

impl std::fmt::Debug for GuestRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRuntime")
            .field("plugin", &self.env.plugin)
            .field("used_memory", &self.lua.used_memory())
            .finish_non_exhaustive()
    }
}

impl GuestRuntime {
    /// Build a guest state for `env.plugin`.
    pub fn new(env: GuestEnv) -> Result<Self> {
        let lua = Lua::new();

        primitives::register_all(&lua, &env)
            .with_context(|| format!("Failed to register primitives for [{}]", env.plugin))?;

        OutputRedirector::new(Arc::clone(&env.registry), Arc::clone(&env.sink))
            .install(&lua)
            .with_context(|| format!("Failed to redirect output for [{}]", env.plugin))?;

        let runtime = Self { lua, env };
        runtime.arm_stop_hook();
        Ok(runtime)
    }

    fn arm_stop_hook(&self) {
        let stop = Arc::clone(&self.env.stop);
        let ticks = AtomicU32::new(0);

        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
            move |_lua, _debug| {
                if stop.load(Ordering::Acquire) {
                    return Err(stopping_error());
                }
                if ticks.fetch_add(1, Ordering::Relaxed) % YIELD_EVERY == 0 {
                    std::thread::yield_now();
                }
                Ok(mlua::VmState::Continue)
            },
        );
    }

    /// The plugin this state belongs to.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.env.plugin
    }

    /// Direct access for callers that need raw Lua.
    #[must_use]
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Let `require` find modules next to the plugin's entry file.
    pub fn add_package_path(&self, dir: &Path) -> Result<()> {
        let package: mlua::Table = self
            .lua
            .globals()
            .get("package")
            .map_err(|e| anyhow!("Failed to get package table: {e}"))?;

        let current_path: String = package
            .get("path")
            .map_err(|e| anyhow!("Failed to get package.path: {e}"))?;

        let new_path = format!(
            "{dir}/?.lua;{dir}/?/init.lua;{current_path}",
            dir = dir.display()
        );

        package
            .set("path", new_path)
            .map_err(|e| anyhow!("Failed to set package.path: {e}"))?;

        Ok(())
    }

    /// Load and execute a Lua file.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read Lua file: {}", path.display()))?;

        if let Some(dir) = path.parent() {
            self.add_package_path(dir)?;
        }

        self.load_string(&path.to_string_lossy(), &source)
    }

    /// Load and execute Lua source.
    pub fn load_string(&self, name: &str, source: &str) -> Result<()> {
        self.lua
            .load(source)
            .set_name(name)
            .exec()
            .map_err(|e| anyhow!("Failed to execute Lua {}: {}", name, e))?;

        log::debug!("[Lua] [{}] loaded {}", self.env.plugin, name);
        Ok(())
    }

    /// Call global `name` if the plugin defines it. Returns whether it ran.
    pub fn call_lifecycle(&self, name: &str) -> Result<bool> {
        let Value::Function(function) = self
            .lua
            .globals()
            .get::<Value>(name)
            .map_err(|e| anyhow!("Failed to read global {name}: {e}"))?
        else {
            return Ok(false);
        };

        function
            .call::<()>(())
            .map_err(|e| anyhow!("{name}() failed: {e}"))?;
        Ok(true)
    }

    /// Run `on_unload` under a fixed instruction budget.
    ///
    /// The stop flag is already set when this runs, so the stop hook is
    /// swapped for a hard budget that still bounds a runaway handler.
    pub fn run_unload(&self) -> Result<bool> {
        self.lua.remove_hook();
        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(UNLOAD_INSTRUCTION_BUDGET),
            |_lua, _debug| {
                Err(mlua::Error::RuntimeError(format!(
                    "{ON_UNLOAD}() exceeded {UNLOAD_INSTRUCTION_BUDGET} instructions"
                )))
            },
        );

        let result = self.call_lifecycle(ON_UNLOAD);
        self.lua.remove_hook();
        result
    }

    /// Invoke callback `id` registered by `tunnel.on` with `payload`.
    ///
    /// Returns `false` if the callback was removed in the meantime.
    pub fn dispatch(&self, id: u64, payload: &serde_json::Value) -> Result<bool> {
        let Some(callback): Option<Function> = tunnel::lookup_callback(&self.lua, id)
            .map_err(|e| anyhow!("Failed to look up callback {id}: {e}"))?
        else {
            return Ok(false);
        };

        let argument = json_to_lua(&self.lua, payload)
            .map_err(|e| anyhow!("Failed to convert payload for callback {id}: {e}"))?;

        callback
            .call::<()>(argument)
            .map_err(|e| anyhow!("Callback {id} failed: {e}"))?;
        Ok(true)
    }
}
