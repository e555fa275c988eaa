use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::model::Identity;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

pub mod memory;
pub mod websocket;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("credential rejected: {0}")]
    Auth(String),
    #[error("handshake timed out")]
    Timeout,
    #[error("transport not connected")]
    NotConnected,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Auth(_))
    }
}

/// Everything needed to open (or resume) a session with the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub endpoint: Url,
    pub module: String,
    pub token: Option<String>,
}

impl ConnectRequest {
    pub fn new(endpoint: Url, module: impl Into<String>, token: Option<String>) -> Self {
        let token = token.filter(|t| !t.trim().is_empty());
        Self {
            endpoint,
            module: module.into(),
            token,
        }
    }
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub identity: Identity,
    pub token: String,
}

/// Sending half of an established link. Sends never block; delivery is fire-and-forget.
pub trait Outbound: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError>;
    fn close(&self);
    fn is_open(&self) -> bool;
}

/// An established session. `inbound` yields `None` once the link is gone.
pub struct Link {
    pub handshake: Handshake,
    pub outbound: Arc<dyn Outbound>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<Link, TransportError>;
}
