//! Output redirection for guest code.
//!
//! Replaces `print`, `io.write`, `io.stdout` and `io.stderr` in a guest
//! state. Every write is attributed through the [`ThreadRegistry`] at the
//! moment it happens, so output lands under whichever plugin is running on
//! the calling thread.
//!
//! Writes never raise into Lua: formatting failures fall back to a
//! placeholder and a panicking sink is caught.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::{Function, Lua, Table, Value, Variadic};

use crate::plugins::attribution::ThreadRegistry;
use crate::sink::LogSink;

/// Shown in place of a value that cannot be converted to text.
const UNPRINTABLE: &str = "<unprintable>";

/// Which standard stream a write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Regular output.
    Stdout,
    /// Error output.
    Stderr,
}

/// Routes guest writes to a [`LogSink`].
pub struct OutputRedirector {
    registry: Arc<ThreadRegistry>,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for OutputRedirector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRedirector").finish_non_exhaustive()
    }
}

impl OutputRedirector {
    /// Create a redirector.
    pub fn new(registry: Arc<ThreadRegistry>, sink: Arc<dyn LogSink>) -> Self {
        Self { registry, sink }
    }

    /// Forward one write. Whitespace-only text is dropped.
    pub fn write(&self, stream: Stream, text: &str) {
        let text = text.trim_end_matches(['\r', '\n']);
        if text.trim().is_empty() {
            return;
        }

        let owner = self.registry.resolve_current();
        let delivered = catch_unwind(AssertUnwindSafe(|| match stream {
            Stream::Stdout => self.sink.log_plugin_message(&owner, text),
            Stream::Stderr => self.sink.log_error(&owner, text),
        }));
        if delivered.is_err() {
            log::error!("[Output] Log sink panicked while writing output of [{}]", owner);
        }
    }

    /// Install the overrides into `lua`.
    pub fn install(self, lua: &Lua) -> Result<()> {
        let this = Arc::new(self);

        let redirector = Arc::clone(&this);
        let print_fn = lua
            .create_function(move |lua, args: Variadic<Value>| {
                redirector.write(Stream::Stdout, &join_values(lua, args, "\t"));
                Ok(())
            })
            .map_err(|e| anyhow!("Failed to create print override: {e}"))?;
        lua.globals()
            .set("print", print_fn)
            .map_err(|e| anyhow!("Failed to override print: {e}"))?;

        let io: Table = lua
            .globals()
            .get("io")
            .map_err(|e| anyhow!("Failed to get io table: {e}"))?;

        let stdout = stream_table(lua, Arc::clone(&this), Stream::Stdout)
            .map_err(|e| anyhow!("Failed to create io.stdout override: {e}"))?;
        let stderr = stream_table(lua, Arc::clone(&this), Stream::Stderr)
            .map_err(|e| anyhow!("Failed to create io.stderr override: {e}"))?;

        let redirector = Arc::clone(&this);
        let stdout_ret = stdout.clone();
        let write_fn = lua
            .create_function(move |lua, args: Variadic<Value>| {
                redirector.write(Stream::Stdout, &join_values(lua, args, ""));
                Ok(stdout_ret.clone())
            })
            .map_err(|e| anyhow!("Failed to create io.write override: {e}"))?;

        io.set("write", write_fn)
            .map_err(|e| anyhow!("Failed to override io.write: {e}"))?;
        io.set("stdout", stdout)
            .map_err(|e| anyhow!("Failed to override io.stdout: {e}"))?;
        io.set("stderr", stderr)
            .map_err(|e| anyhow!("Failed to override io.stderr: {e}"))?;

        Ok(())
    }
}

/// File-like table whose `write` method goes to `stream`.
fn stream_table(lua: &Lua, redirector: Arc<OutputRedirector>, stream: Stream) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    table.set(
        "write",
        lua.create_function(move |lua, (this, args): (Value, Variadic<Value>)| {
            redirector.write(stream, &join_values(lua, args, ""));
            Ok(this)
        })?,
    )?;
    table.set("flush", lua.create_function(|_, this: Value| Ok(this))?)?;
    table.set("setvbuf", lua.create_function(|_, _: Variadic<Value>| Ok(true))?)?;
    table.set("close", lua.create_function(|_, _: Variadic<Value>| Ok(true))?)?;

    Ok(table)
}

/// Convert values with the guest's own `tostring` and join them.
fn join_values(lua: &Lua, values: Variadic<Value>, separator: &str) -> String {
    let tostring: Option<Function> = lua.globals().get("tostring").ok();

    values
        .into_iter()
        .map(|value| match value {
            Value::String(s) => s.to_string_lossy().to_string(),
            Value::Integer(i) => i.to_string(),
            other => tostring
                .as_ref()
                .and_then(|f| f.call::<String>(other).ok())
                .unwrap_or_else(|| UNPRINTABLE.to_string()),
        })
        .collect::<Vec<_>>()
        .join(separator)
}
