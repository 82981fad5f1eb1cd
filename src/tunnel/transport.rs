//! Transport seam for the tunnel.
//!
//! [`TunnelConnection`](super::TunnelConnection) only sees these traits;
//! the production implementation is [`crate::ws::WsTransport`], tests plug
//! in scripted fakes.

use anyhow::Result;
use async_trait::async_trait;

use crate::ws::WsMessage;

/// Opens physical connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `url` and complete the handshake.
    async fn connect(&self, url: &str) -> Result<Link>;
}

/// Write half of an established connection.
#[async_trait]
pub trait LinkWriter: Send {
    /// Send a UTF-8 text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Answer a ping.
    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()>;

    /// Send a close frame and flush.
    async fn send_close(&mut self) -> Result<()>;
}

/// Read half of an established connection.
#[async_trait]
pub trait LinkReader: Send {
    /// Next frame, or `None` when the stream ended.
    async fn recv(&mut self) -> Option<Result<WsMessage>>;
}

/// An established connection split into independent halves.
pub struct Link {
    /// Outbound half.
    pub writer: Box<dyn LinkWriter>,
    /// Inbound half.
    pub reader: Box<dyn LinkReader>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}
