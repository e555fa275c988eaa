//! In-process stand-in for the authoritative store.
//!
//! Speaks the same message vocabulary as the WebSocket transport so the client
//! engine can be exercised end to end without a network: it issues identities
//! and tokens, answers pixel subscriptions with the current table followed by an
//! applied signal, and broadcasts every accepted `sendPixel` to subscribers.
//! Test hooks allow severing links, refusing connects and holding applied
//! signals back.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ConnectRequest, Connector, Handshake, Link, Outbound, TransportError};
use crate::model::{Identity, NewPixel, Pixel};
use crate::protocol::{
    ClientMessage, PIXEL_TABLE, PixelRow, ReducerStatus, RequestId, SEND_PIXEL, ServerMessage,
};

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    rows: Vec<PixelRow>,
    clients: HashMap<u64, ClientSlot>,
    tokens: HashMap<String, Identity>,
    next_client: u64,
    next_identity: u64,
    refuse_connects: u32,
    hold_applied: bool,
    held: Vec<(u64, ServerMessage)>,
    reject_reducers: Option<String>,
    connects: u64,
    subscribe_requests: u64,
    reducer_calls: Vec<NewPixel>,
}

struct ClientSlot {
    tx: mpsc::UnboundedSender<ServerMessage>,
    identity: Identity,
    subscribed: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
        }
    }

    /// Pre-register a token so a client presenting it resumes `identity`.
    pub fn register_token(&self, token: impl Into<String>, identity: Identity) {
        self.state.lock().tokens.insert(token.into(), identity);
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.state.lock().refuse_connects = count;
    }

    /// Queue subscription-applied signals instead of sending them.
    pub fn hold_applied(&self, hold: bool) {
        self.state.lock().hold_applied = hold;
    }

    /// Deliver queued applied signals, oldest first.
    pub fn release_applied(&self) -> usize {
        let mut state = self.state.lock();
        let held = std::mem::take(&mut state.held);
        let released = held.len();
        for (client, message) in held {
            if let Some(slot) = state.clients.get(&client) {
                let _ = slot.tx.send(message);
            }
        }
        released
    }

    pub fn reject_reducers(&self, reason: Option<String>) {
        self.state.lock().reject_reducers = reason;
    }

    /// Commit a row as if some other participant had drawn it.
    pub fn insert(&self, pixel: &Pixel) {
        let mut state = self.state.lock();
        let row = PixelRow::from(pixel);
        state.commit(row);
    }

    /// Sever every live link, as a server restart or network partition would.
    pub fn drop_all(&self) {
        let mut state = self.state.lock();
        let dropped = state.clients.len();
        state.clients.clear();
        debug!(target = "pixel_canvas::memory_store", dropped, "dropped all clients");
    }

    /// Forget every committed row, as a store restarted on empty storage would.
    pub fn clear_rows(&self) {
        self.state.lock().rows.clear();
    }

    pub fn connected_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn connect_count(&self) -> u64 {
        self.state.lock().connects
    }

    pub fn subscribe_count(&self) -> u64 {
        self.state.lock().subscribe_requests
    }

    pub fn reducer_calls(&self) -> Vec<NewPixel> {
        self.state.lock().reducer_calls.clone()
    }

    pub fn rows(&self) -> Vec<PixelRow> {
        self.state.lock().rows.clone()
    }

    fn handle(&self, client: u64, message: ClientMessage) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.clients.contains_key(&client) {
            return Err(TransportError::NotConnected);
        }
        match message {
            ClientMessage::Subscribe { request_id, query } => {
                state.subscribe_requests += 1;
                state.subscribe(client, request_id, query);
            }
            ClientMessage::CallReducer {
                request_id,
                reducer,
                args,
            } => state.call_reducer(client, request_id, reducer, args),
        }
        Ok(())
    }
}

impl StoreState {
    fn send(&self, client: u64, message: ServerMessage) {
        if let Some(slot) = self.clients.get(&client) {
            let _ = slot.tx.send(message);
        }
    }

    fn subscribe(&mut self, client: u64, request_id: RequestId, query: String) {
        let normalized = query.trim().trim_end_matches(';').to_ascii_lowercase();
        if normalized != crate::protocol::PIXEL_QUERY.to_ascii_lowercase() {
            self.send(
                client,
                ServerMessage::SubscriptionError {
                    request_id,
                    error: format!("unsupported query: {query}"),
                },
            );
            return;
        }
        for row in &self.rows {
            let value = serde_json::to_value(row).unwrap_or_default();
            self.send(
                client,
                ServerMessage::RowInsert {
                    table: PIXEL_TABLE.to_string(),
                    row: value,
                },
            );
        }
        if let Some(slot) = self.clients.get_mut(&client) {
            slot.subscribed = true;
        }
        let applied = ServerMessage::SubscriptionApplied { request_id, query };
        if self.hold_applied {
            self.held.push((client, applied));
        } else {
            self.send(client, applied);
        }
    }

    fn call_reducer(
        &mut self,
        client: u64,
        request_id: RequestId,
        reducer: String,
        args: serde_json::Value,
    ) {
        let outcome = if reducer != SEND_PIXEL {
            Err(format!("no such reducer: {reducer}"))
        } else if let Some(reason) = self.reject_reducers.clone() {
            Err(reason)
        } else {
            serde_json::from_value::<NewPixel>(args).map_err(|err| err.to_string())
        };
        let (status, message) = match outcome {
            Ok(pixel) => {
                self.reducer_calls.push(pixel.clone());
                self.commit(PixelRow::from(pixel));
                (ReducerStatus::Committed, None)
            }
            Err(reason) => (ReducerStatus::Failed, Some(reason)),
        };
        self.send(
            client,
            ServerMessage::ReducerResult {
                request_id,
                reducer,
                status,
                message,
            },
        );
    }

    fn commit(&mut self, row: PixelRow) {
        let value = serde_json::to_value(&row).unwrap_or_default();
        self.rows.push(row);
        for slot in self.clients.values().filter(|slot| slot.subscribed) {
            let _ = slot.tx.send(ServerMessage::RowInsert {
                table: PIXEL_TABLE.to_string(),
                row: value.clone(),
            });
        }
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Link, TransportError> {
        let mut state = self.store.state.lock();
        state.connects += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(TransportError::Connect("connection refused".into()));
        }

        let identity = match &request.token {
            Some(token) => *state
                .tokens
                .get(token)
                .ok_or_else(|| TransportError::Auth("unknown token".into()))?,
            None => {
                state.next_identity += 1;
                let mut bytes = [0u8; 32];
                bytes[24..].copy_from_slice(&state.next_identity.to_be_bytes());
                Identity::from_bytes(bytes)
            }
        };
        let token = format!("token-{}", identity.to_hex());
        state.tokens.insert(token.clone(), identity);

        state.next_client += 1;
        let client = state.next_client;
        let (tx, rx) = mpsc::unbounded_channel();
        state.clients.insert(
            client,
            ClientSlot {
                tx,
                identity,
                subscribed: false,
            },
        );
        debug!(target = "pixel_canvas::memory_store", client, identity = %identity.short(), "client connected");

        Ok(Link {
            handshake: Handshake { identity, token },
            outbound: Arc::new(MemoryOutbound {
                client,
                store: self.store.clone(),
            }),
            inbound: rx,
        })
    }
}

struct MemoryOutbound {
    client: u64,
    store: MemoryStore,
}

impl Outbound for MemoryOutbound {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.store.handle(self.client, message)
    }

    fn close(&self) {
        let mut state = self.store.state.lock();
        if let Some(slot) = state.clients.remove(&self.client) {
            debug!(target = "pixel_canvas::memory_store", client = self.client, identity = %slot.identity.short(), "client closed");
        }
    }

    fn is_open(&self) -> bool {
        self.store.state.lock().clients.contains_key(&self.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Color;
    use url::Url;

    fn request(token: Option<String>) -> ConnectRequest {
        ConnectRequest::new(Url::parse("ws://127.0.0.1:3000").unwrap(), "canvas", token)
    }

    #[tokio::test]
    async fn token_resumes_identity() {
        let store = MemoryStore::new();
        let connector = store.connector();
        let first = connector.connect(&request(None)).await.unwrap();
        let resumed = connector
            .connect(&request(Some(first.handshake.token.clone())))
            .await
            .unwrap();
        assert_eq!(first.handshake.identity, resumed.handshake.identity);

        let err = connector
            .connect(&request(Some("bogus".into())))
            .await
            .err()
            .unwrap();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn subscription_replays_rows_before_applied() {
        let store = MemoryStore::new();
        store.insert(&Pixel::new(1, 2, Color::WHITE, Identity::ANONYMOUS));
        let mut link = store.connector().connect(&request(None)).await.unwrap();
        link.outbound
            .send(ClientMessage::Subscribe {
                request_id: RequestId(1),
                query: crate::protocol::PIXEL_QUERY.into(),
            })
            .unwrap();
        assert!(matches!(
            link.inbound.recv().await,
            Some(ServerMessage::RowInsert { .. })
        ));
        assert!(matches!(
            link.inbound.recv().await,
            Some(ServerMessage::SubscriptionApplied { .. })
        ));
    }

    #[tokio::test]
    async fn drop_all_ends_inbound_streams() {
        let store = MemoryStore::new();
        let mut link = store.connector().connect(&request(None)).await.unwrap();
        store.drop_all();
        assert!(link.inbound.recv().await.is_none());
        assert!(!link.outbound.is_open());
    }
}
