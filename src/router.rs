//! Message routing between tunnels and their consumers.
//!
//! The router is the [`TunnelHandler`] for every tunnel: it tracks the open
//! connections by tunnel name and fans inbound frames out to subscribed
//! handlers. On the outbound side it implements [`MessageBus`], the seam the
//! plugin host posts through.
//!
//! Inbound frames are dispatched by identifier: the CDP `method` field when
//! present, otherwise a `type` field (the convention plugin payloads use).
//!
//! # Deadlock Prevention
//!
//! Handlers are collected under the read lock and invoked after it is
//! released, so a handler may subscribe, unsubscribe or post without
//! deadlocking.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::tunnel::{ConnectionHandle, TunnelHandler};

/// Callback invoked with a decoded inbound message.
pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token returned by [`MessageBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Where an outbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every open connection.
    Global,
    /// The primary connection only.
    Shared,
}

/// A message queued by a plugin.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Delivery target.
    pub target: Target,
    /// JSON payload.
    pub payload: Value,
}

/// Outbound and subscription surface offered to the plugin host.
pub trait MessageBus: Send + Sync {
    /// Send to every open connection. True if at least one accepted it.
    fn post_global(&self, payload: &Value) -> bool;

    /// Send to the primary connection. False if it is not connected.
    fn post_shared(&self, payload: &Value) -> bool;

    /// Register `handler` for inbound messages with `identifier`.
    fn subscribe(&self, identifier: &str, owner: &str, handler: MessageHandler) -> SubscriptionId;

    /// Remove one subscription. Returns whether it existed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Remove every subscription registered by `owner`.
    fn unsubscribe_owner(&self, owner: &str) -> usize;

    /// Whether any connection is open.
    fn is_connected(&self) -> bool;

    /// Route an [`OutboundMessage`] by its target.
    fn post(&self, message: &OutboundMessage) -> bool {
        match message.target {
            Target::Global => self.post_global(&message.payload),
            Target::Shared => self.post_shared(&message.payload),
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    owner: String,
    handler: MessageHandler,
}

/// Connection registry plus identifier-based dispatch.
pub struct MessageRouter {
    primary: String,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("primary", &self.primary)
            .field("connections", &self.connection_names())
            .finish_non_exhaustive()
    }
}

impl MessageRouter {
    /// Create a router whose shared posts go to the tunnel named `primary`.
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            connections: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Name of the primary tunnel.
    #[must_use]
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Names of the tunnels currently connected, sorted.
    pub fn connection_names(&self) -> Vec<String> {
        let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = connections
            .values()
            .filter(|c| c.is_open())
            .map(|c| c.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Decode an inbound frame and invoke every matching handler.
    pub fn dispatch_text(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("[Router] Dropping malformed frame: {e}");
                return;
            }
        };

        let Some(identifier) = message_identifier(&value) else {
            return;
        };

        let handlers: Vec<(String, MessageHandler)> = {
            let subscriptions = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
            match subscriptions.get(identifier) {
                Some(subs) => subs
                    .iter()
                    .map(|s| (s.owner.clone(), Arc::clone(&s.handler)))
                    .collect(),
                None => return,
            }
        };

        for (owner, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&value))).is_err() {
                log::error!("[Router] Handler for '{identifier}' owned by [{owner}] panicked");
            }
        }
    }

    fn send_serialized(&self, payload: &Value, filter: impl Fn(&ConnectionHandle) -> bool) -> bool {
        let text = match serde_json::to_string(payload) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("[Router] Failed to serialize payload: {e}");
                return false;
            }
        };

        let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = false;
        for connection in connections.values().filter(|c| filter(c)) {
            delivered |= connection.send_text(text.clone());
        }
        delivered
    }
}

/// `method` if present, else `type`.
fn message_identifier(value: &Value) -> Option<&str> {
    value
        .get("method")
        .and_then(Value::as_str)
        .or_else(|| value.get("type").and_then(Value::as_str))
}

impl TunnelHandler for MessageRouter {
    fn on_open(&self, connection: &ConnectionHandle) {
        let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        connections.insert(connection.name().to_string(), connection.clone());
    }

    fn on_message(&self, _connection: &ConnectionHandle, text: &str) {
        self.dispatch_text(text);
    }

    fn on_close(&self, connection: &ConnectionHandle) {
        let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        // A reconnect may already have registered a newer session
        if connections
            .get(connection.name())
            .is_some_and(|current| current.same_session(connection))
        {
            connections.remove(connection.name());
        }
    }
}

impl MessageBus for MessageRouter {
    fn post_global(&self, payload: &Value) -> bool {
        self.send_serialized(payload, |_| true)
    }

    fn post_shared(&self, payload: &Value) -> bool {
        self.send_serialized(payload, |c| c.name() == self.primary)
    }

    fn subscribe(&self, identifier: &str, owner: &str, handler: MessageHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        subscriptions
            .entry(identifier.to_string())
            .or_default()
            .push(Subscription {
                id,
                owner: owner.to_string(),
                handler,
            });
        log::debug!("[Router] [{owner}] subscribed to '{identifier}'");
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        subscriptions.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    fn unsubscribe_owner(&self, owner: &str) -> usize {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        subscriptions.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.owner != owner);
            removed += before - subs.len();
            !subs.is_empty()
        });
        removed
    }

    fn is_connected(&self) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(ConnectionHandle::is_open)
    }
}
