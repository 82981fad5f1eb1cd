//! Tunnel primitive: talk to the host debugger from plugin code.
//!
//! ```lua
//! -- Broadcast to every connected tunnel
//! tunnel.post_global({ type = "ping" })
//!
//! -- Primary tunnel only (the shared page context when configured)
//! tunnel.post_shared({ id = 1, method = "Runtime.evaluate", params = { expression = "1+1" } })
//!
//! -- React to inbound messages by CDP method (or `type`)
//! local sub = tunnel.on("Runtime.consoleAPICalled", function(msg)
//!     print(msg.params.type)
//! end)
//! tunnel.off(sub)
//!
//! if not tunnel.connected() then log.warn("host not attached") end
//! ```
//!
//! # Threading
//!
//! Router handlers run on tunnel threads, which must never touch this Lua
//! state. A subscription therefore only forwards the payload into the
//! plugin's inbox; the plugin thread looks the callback up again with
//! [`lookup_callback`] and runs it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::{Function, Lua, RegistryKey, Value};

use super::json::lua_to_json;
use crate::lua::GuestEnv;
use crate::plugins::InboxEvent;
use crate::router::{MessageHandler, SubscriptionId};

/// Lua callbacks registered through `tunnel.on`, stored as Lua app data.
#[derive(Default)]
pub(crate) struct CallbackTable {
    entries: HashMap<u64, Callback>,
    next_id: u64,
}

struct Callback {
    subscription: SubscriptionId,
    key: RegistryKey,
}

impl CallbackTable {
    /// Number of registered callbacks.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The Lua function behind callback `id`, if still registered.
pub(crate) fn lookup_callback(lua: &Lua, id: u64) -> mlua::Result<Option<Function>> {
    let Some(table) = lua.app_data_ref::<CallbackTable>() else {
        return Ok(None);
    };
    match table.entries.get(&id) {
        Some(callback) => lua.registry_value::<Function>(&callback.key).map(Some),
        None => Ok(None),
    }
}

/// Register the `tunnel` table.
pub fn register(lua: &Lua, env: &GuestEnv) -> Result<()> {
    lua.set_app_data(CallbackTable::default());

    let tunnel_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create tunnel table: {e}"))?;

    // tunnel.post_global(payload) -> bool
    let bus = Arc::clone(&env.bus);
    let post_global_fn = lua
        .create_function(move |lua, payload: Value| {
            let payload = lua_to_json(lua, payload)?;
            Ok(bus.post_global(&payload))
        })
        .map_err(|e| anyhow!("Failed to create tunnel.post_global function: {e}"))?;

    // tunnel.post_shared(payload) -> bool
    let bus = Arc::clone(&env.bus);
    let post_shared_fn = lua
        .create_function(move |lua, payload: Value| {
            let payload = lua_to_json(lua, payload)?;
            Ok(bus.post_shared(&payload))
        })
        .map_err(|e| anyhow!("Failed to create tunnel.post_shared function: {e}"))?;

    // tunnel.on(identifier, callback) -> id
    let bus = Arc::clone(&env.bus);
    let inbox = env.inbox.clone();
    let owner = Arc::clone(&env.plugin);
    let on_fn = lua
        .create_function(move |lua, (identifier, callback): (String, Function)| {
            let key = lua.create_registry_value(callback)?;
            let mut table = lua
                .app_data_mut::<CallbackTable>()
                .ok_or_else(|| mlua::Error::RuntimeError("tunnel callbacks unavailable".into()))?;

            let id = table.next_id;
            table.next_id += 1;

            let inbox = inbox.clone();
            let handler: MessageHandler = Arc::new(move |payload: &serde_json::Value| {
                // The plugin may already be gone; nothing to deliver to then
                let _ = inbox.send(InboxEvent::Message {
                    callback: id,
                    payload: payload.clone(),
                });
            });
            let subscription = bus.subscribe(&identifier, &owner, handler);
            table.entries.insert(id, Callback { subscription, key });

            Ok(id)
        })
        .map_err(|e| anyhow!("Failed to create tunnel.on function: {e}"))?;

    // tunnel.off(id) -> bool
    let bus = Arc::clone(&env.bus);
    let off_fn = lua
        .create_function(move |lua, id: u64| {
            let removed = lua
                .app_data_mut::<CallbackTable>()
                .and_then(|mut table| table.entries.remove(&id));
            let Some(callback) = removed else {
                return Ok(false);
            };
            bus.unsubscribe(callback.subscription);
            lua.remove_registry_value(callback.key)?;
            Ok(true)
        })
        .map_err(|e| anyhow!("Failed to create tunnel.off function: {e}"))?;

    // tunnel.connected() -> bool
    let bus = Arc::clone(&env.bus);
    let connected_fn = lua
        .create_function(move |_, ()| Ok(bus.is_connected()))
        .map_err(|e| anyhow!("Failed to create tunnel.connected function: {e}"))?;

    for (name, function) in [
        ("post_global", post_global_fn),
        ("post_shared", post_shared_fn),
        ("on", on_fn),
        ("off", off_fn),
        ("connected", connected_fn),
    ] {
        tunnel_table
            .set(name, function)
            .map_err(|e| anyhow!("Failed to set tunnel.{name}: {e}"))?;
    }

    lua.globals()
        .set("tunnel", tunnel_table)
        .map_err(|e| anyhow!("Failed to register tunnel table globally: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::testing::test_env_with_bus;
    use crate::router::{MessageBus, MessageRouter};
    use crate::tunnel::{ConnectionHandle, TunnelHandler};

    fn setup(plugin: &str) -> (Lua, Arc<MessageRouter>, std::sync::mpsc::Receiver<InboxEvent>) {
        let router = Arc::new(MessageRouter::new("browser"));
        let (env, _sink, rx) = test_env_with_bus(plugin, router.clone() as Arc<dyn MessageBus>);
        let lua = Lua::new();
        register(&lua, &env).expect("register tunnel");
        (lua, router, rx)
    }

    #[test]
    fn test_posts_false_while_disconnected() {
        let (lua, _router, _rx) = setup("p");
        let (global, shared, connected): (bool, bool, bool) = lua
            .load(r#"return tunnel.post_global({type="ping"}), tunnel.post_shared({id=1}), tunnel.connected()"#)
            .eval()
            .expect("calls");
        assert!(!global);
        assert!(!shared);
        assert!(!connected);
    }

    #[test]
    fn test_post_global_serializes_table() {
        let (lua, router, _rx) = setup("p");
        let (handle, mut frames) = ConnectionHandle::channel("browser", 0);
        router.on_open(&handle);

        let sent: bool = lua
            .load(r#"return tunnel.post_global({type="ping", n=2})"#)
            .eval()
            .expect("post");
        assert!(sent);

        let frame = frames.try_recv().expect("one frame");
        let parsed: serde_json::Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(parsed, serde_json::json!({"type": "ping", "n": 2}));
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn test_on_forwards_to_inbox_and_off_stops() {
        let (lua, router, rx) = setup("watcher");

        let id: u64 = lua
            .load(r#"return tunnel.on("ping", function(msg) end)"#)
            .eval()
            .expect("subscribe");
        assert_eq!(router.subscription_count(), 1);

        router.dispatch_text(r#"{"type":"ping","seq":1}"#);
        match rx.try_recv().expect("inbox event") {
            InboxEvent::Message { callback, payload } => {
                assert_eq!(callback, id);
                assert_eq!(payload["seq"], 1);
            }
            InboxEvent::Stop => panic!("unexpected stop"),
        }
        assert!(lookup_callback(&lua, id).expect("lookup").is_some());

        let removed: bool = lua.load(format!("return tunnel.off({id})")).eval().expect("off");
        assert!(removed);
        assert_eq!(router.subscription_count(), 0);
        assert!(lookup_callback(&lua, id).expect("lookup").is_none());

        let again: bool = lua.load(format!("return tunnel.off({id})")).eval().expect("off");
        assert!(!again);
    }

    #[test]
    fn test_subscriptions_owned_by_plugin() {
        let (lua, router, _rx) = setup("owner-a");
        lua.load(r#"tunnel.on("a", function() end) tunnel.on("b", function() end)"#)
            .exec()
            .expect("subscribe");
        assert_eq!(router.unsubscribe_owner("owner-a"), 2);
        assert_eq!(lua.app_data_ref::<CallbackTable>().expect("table").len(), 2);
    }
}
