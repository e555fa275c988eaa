//! Transport lifecycle: `Disconnected → Connecting → Connected → Disconnected`.
//!
//! The manager never fails synchronously. Each connection attempt runs in its
//! own task and reports back through [`ConnectionEvent`]s; the client event
//! loop feeds those into [`ConnectionManager::on_event`], which updates the
//! [`SessionState`], persists the auth token and tells the caller when to
//! (re-)establish subscriptions.

pub mod backoff;
pub mod handle;

use rand::thread_rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use url::Url;

pub use backoff::ReconnectPolicy;
pub use handle::ConnectionHandle;

use crate::event::{ConnectionEvent, EventSenders, Generation, ReducerEvent, RowEvent, SubscriptionEvent};
use crate::protocol::{PIXEL_TABLE, PixelRow, ServerMessage};
use crate::session::credentials::profile_key;
use crate::session::{ConnectionStatus, CredentialError, CredentialStore, SessionState};
use crate::transport::{ConnectRequest, Connector, Link, TransportError};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("credential storage error: {0}")]
    Credentials(#[from] CredentialError),
    #[error("gave up after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Where the manager connects to; remembered so reconnects can reuse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub endpoint: Url,
    pub module: String,
}

impl ConnectTarget {
    pub fn profile(&self) -> String {
        profile_key(&self.endpoint, &self.module)
    }
}

/// What the event loop must do after the manager processed an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Entered `Connected`; subscriptions must be (re)issued for this generation.
    Connected { generation: Generation },
    /// Left `Connected` or `Connecting`; a retry may already be scheduled.
    Disconnected { retry_in: Option<Duration> },
    /// A connection failure was recorded while staying in the current state.
    Failed,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    policy: ReconnectPolicy,
    events: EventSenders,
    handle: ConnectionHandle,
    session: SessionState,
    target: Option<ConnectTarget>,
    generation: Generation,
    attempt: u32,
    closed: bool,
    last_error: Option<String>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        policy: ReconnectPolicy,
        events: EventSenders,
        handle: ConnectionHandle,
    ) -> Self {
        Self {
            connector,
            credentials,
            policy,
            events,
            handle,
            session: SessionState::default(),
            target: None,
            generation: 0,
            attempt: 0,
            closed: true,
            last_error: None,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Loads the token cached for `endpoint`/`module`, if any. Storage errors are
    /// logged and treated as "no token".
    pub fn cached_token(&self, endpoint: &Url, module: &str) -> Option<String> {
        let profile = profile_key(endpoint, module);
        match self.credentials.load(&profile) {
            Ok(token) => token,
            Err(err) => {
                warn!(target = "pixel_canvas::connection", profile = %profile, error = %err, "failed to load cached token");
                None
            }
        }
    }

    /// Enters `Connecting` and spawns an attempt. Always succeeds; failures
    /// arrive later as [`ConnectionEvent::Failed`].
    pub fn start(&mut self, endpoint: Url, module: impl Into<String>, cached_token: Option<String>) {
        if let Some(outbound) = self.handle.detach() {
            outbound.close();
        }
        let target = ConnectTarget {
            endpoint,
            module: module.into(),
        };
        self.session.auth_token = cached_token.filter(|token| !token.trim().is_empty());
        self.target = Some(target);
        self.closed = false;
        self.attempt = 0;
        self.begin_attempt(Duration::ZERO);
    }

    /// Explicit close: disconnect and do not reconnect.
    pub fn close(&mut self) {
        self.closed = true;
        self.generation += 1;
        if let Some(outbound) = self.handle.detach() {
            outbound.close();
        }
        if self.session.status != ConnectionStatus::Disconnected {
            info!(target = "pixel_canvas::connection", "connection closed");
        }
        self.session.disconnected();
    }

    pub fn on_event(&mut self, event: ConnectionEvent) -> Option<Transition> {
        if event.generation() != self.generation {
            trace!(target = "pixel_canvas::connection", ?event, current = self.generation, "ignoring stale connection event");
            if let ConnectionEvent::Established { outbound, .. } = event {
                outbound.close();
            }
            return None;
        }

        match event {
            ConnectionEvent::Established {
                generation,
                handshake,
                outbound,
            } => {
                self.attempt = 0;
                self.last_error = None;
                self.handle
                    .attach(generation, handshake.identity, outbound);
                self.session
                    .connected(handshake.identity, handshake.token.clone());
                self.persist_token(&handshake.token);
                info!(
                    target = "pixel_canvas::connection",
                    identity = %handshake.identity,
                    generation,
                    "connected to store"
                );
                Some(Transition::Connected { generation })
            }
            ConnectionEvent::Failed { error, .. } => {
                warn!(target = "pixel_canvas::connection", error = %error, attempt = self.attempt, "connection attempt failed");
                if error.is_auth() {
                    self.forget_token();
                }
                self.last_error = Some(error.to_string());
                self.session.disconnected();
                let retry_in = self.schedule_retry();
                if retry_in.is_none() {
                    return Some(Transition::Failed);
                }
                Some(Transition::Disconnected { retry_in })
            }
            ConnectionEvent::Lost { .. } => {
                if let Some(outbound) = self.handle.detach() {
                    outbound.close();
                }
                warn!(target = "pixel_canvas::connection", "connection to store lost");
                self.last_error = Some("connection lost".into());
                self.session.disconnected();
                let retry_in = self.schedule_retry();
                Some(Transition::Disconnected { retry_in })
            }
        }
    }

    fn schedule_retry(&mut self) -> Option<Duration> {
        if self.closed {
            return None;
        }
        if !self.policy.allows(self.attempt) {
            if self.attempt > 0 {
                let err = ConnectionError::RetriesExhausted {
                    attempts: self.attempt,
                };
                warn!(target = "pixel_canvas::connection", error = %err, "not reconnecting");
                self.last_error = Some(err.to_string());
            }
            return None;
        }
        let delay = self.policy.delay_for(self.attempt, &mut thread_rng());
        self.attempt += 1;
        debug!(target = "pixel_canvas::connection", attempt = self.attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.begin_attempt(delay);
        Some(delay)
    }

    fn begin_attempt(&mut self, delay: Duration) {
        let Some(target) = self.target.clone() else {
            return;
        };
        self.generation += 1;
        self.session.connecting();
        let generation = self.generation;
        let request = ConnectRequest::new(
            target.endpoint,
            target.module,
            self.session.auth_token.clone(),
        );
        let connector = self.connector.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match connector.connect(&request).await {
                Ok(link) => run_link(generation, link, events).await,
                Err(error) => {
                    let _ = events
                        .connection
                        .send(ConnectionEvent::Failed { generation, error })
                        .await;
                }
            }
        });
    }

    fn persist_token(&self, token: &str) {
        let Some(target) = &self.target else {
            return;
        };
        if let Err(err) = self.credentials.save(&target.profile(), token) {
            warn!(target = "pixel_canvas::connection", error = %err, "failed to persist auth token");
        }
    }

    fn forget_token(&mut self) {
        self.session.forget_token();
        let Some(target) = &self.target else {
            return;
        };
        if let Err(err) = self.credentials.clear(&target.profile()) {
            warn!(target = "pixel_canvas::connection", error = %err, "failed to clear rejected auth token");
        }
    }
}

/// Announces the link, then demultiplexes its inbound stream into the event
/// channels until the store goes away. This is the only place rows enter the
/// client.
async fn run_link(generation: Generation, link: Link, events: EventSenders) {
    let Link {
        handshake,
        outbound,
        mut inbound,
    } = link;
    if events
        .connection
        .send(ConnectionEvent::Established {
            generation,
            handshake,
            outbound,
        })
        .await
        .is_err()
    {
        return;
    }
    while let Some(message) = inbound.recv().await {
        if !dispatch(generation, message, &events).await {
            return;
        }
    }
    let _ = events
        .connection
        .send(ConnectionEvent::Lost { generation })
        .await;
}

async fn dispatch(generation: Generation, message: ServerMessage, events: &EventSenders) -> bool {
    match message {
        ServerMessage::RowInsert { table, row } => match decode_pixel(&table, &row) {
            Some(row) => {
                let pixel = row.into_pixel();
                send(&events.rows, RowEvent::Insert { generation, pixel }).await
            }
            None => true,
        },
        ServerMessage::RowDelete { table, row } => match decode_pixel(&table, &row) {
            Some(row) => {
                let key = row.into_pixel().key();
                send(&events.rows, RowEvent::Delete { generation, key }).await
            }
            None => true,
        },
        ServerMessage::SubscriptionApplied { request_id, query } => {
            trace!(target = "pixel_canvas::connection", %request_id, query = %query, "subscription applied");
            send(
                &events.subscriptions,
                SubscriptionEvent::Applied {
                    generation,
                    request_id,
                },
            )
            .await
        }
        ServerMessage::SubscriptionError { request_id, error } => {
            send(
                &events.subscriptions,
                SubscriptionEvent::Failed {
                    generation,
                    request_id,
                    error,
                },
            )
            .await
        }
        ServerMessage::ReducerResult {
            request_id,
            reducer,
            status,
            message,
        } => {
            send(
                &events.reducers,
                ReducerEvent {
                    request_id,
                    reducer,
                    status,
                    message,
                },
            )
            .await
        }
        ServerMessage::IdentityToken { identity, .. } => {
            debug!(target = "pixel_canvas::connection", identity = %identity.short(), "ignoring repeated identity token");
            true
        }
    }
}

fn decode_pixel(table: &str, row: &serde_json::Value) -> Option<PixelRow> {
    if table != PIXEL_TABLE {
        trace!(target = "pixel_canvas::connection", table = %table, "ignoring row from unwatched table");
        return None;
    }
    match PixelRow::from_value(row) {
        Ok(row) => Some(row),
        Err(err) => {
            warn!(target = "pixel_canvas::connection", error = %err, "dropping malformed pixel row");
            None
        }
    }
}

async fn send<T>(tx: &mpsc::Sender<T>, event: T) -> bool {
    tx.send(event).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;
    use crate::model::{Color, Identity, Pixel};
    use crate::session::MemoryCredentialStore;
    use crate::transport::memory::MemoryStore;
    use test_timeout::tokio_timeout_test;

    fn endpoint() -> Url {
        Url::parse("ws://127.0.0.1:3000").unwrap()
    }

    fn manager(
        store: &MemoryStore,
        credentials: Arc<MemoryCredentialStore>,
        policy: ReconnectPolicy,
    ) -> (ConnectionManager, event::EventReceivers) {
        let (senders, receivers) = event::channels(64);
        let manager = ConnectionManager::new(
            Arc::new(store.connector()),
            credentials,
            policy,
            senders,
            ConnectionHandle::new(),
        );
        (manager, receivers)
    }

    #[tokio_timeout_test(10)]
    async fn handshake_persists_token_and_attaches_handle() {
        let store = MemoryStore::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let (mut manager, mut events) =
            manager(&store, credentials.clone(), ReconnectPolicy::disabled());
        assert_eq!(manager.session().status, ConnectionStatus::Disconnected);

        manager.start(endpoint(), "canvas", None);
        assert_eq!(manager.session().status, ConnectionStatus::Connecting);

        let event = events.connection.recv().await.unwrap();
        let transition = manager.on_event(event);
        assert!(matches!(transition, Some(Transition::Connected { .. })));

        let session = manager.session().clone();
        assert_eq!(session.status, ConnectionStatus::Connected);
        let token = session.auth_token.clone().unwrap();
        assert_eq!(
            credentials.load("canvas@127.0.0.1:3000").unwrap(),
            Some(token)
        );
        assert_eq!(manager.handle().identity(), session.identity);
    }

    #[tokio_timeout_test(10)]
    async fn failure_without_retry_reports_and_stays_disconnected() {
        let store = MemoryStore::new();
        store.refuse_connects(1);
        let (mut manager, mut events) = manager(
            &store,
            Arc::new(MemoryCredentialStore::new()),
            ReconnectPolicy::disabled(),
        );
        manager.start(endpoint(), "canvas", None);
        let event = events.connection.recv().await.unwrap();
        assert_eq!(manager.on_event(event), Some(Transition::Failed));
        assert_eq!(manager.session().status, ConnectionStatus::Disconnected);
        assert!(manager.last_error().unwrap().contains("refused"));

        manager.start(endpoint(), "canvas", None);
        assert_eq!(manager.session().status, ConnectionStatus::Connecting);
        let event = events.connection.recv().await.unwrap();
        assert!(matches!(
            manager.on_event(event),
            Some(Transition::Connected { .. })
        ));
    }

    #[tokio_timeout_test(10, paused)]
    async fn retries_with_backoff_until_connected() {
        let store = MemoryStore::new();
        store.refuse_connects(2);
        let policy = ReconnectPolicy {
            base: Duration::from_millis(100),
            ceiling: Duration::from_secs(1),
            max_attempts: Some(5),
            jitter: false,
        };
        let (mut manager, mut events) =
            manager(&store, Arc::new(MemoryCredentialStore::new()), policy);
        manager.start(endpoint(), "canvas", None);

        let first = manager.on_event(events.connection.recv().await.unwrap());
        assert_eq!(
            first,
            Some(Transition::Disconnected {
                retry_in: Some(Duration::from_millis(100))
            })
        );
        assert_eq!(manager.session().status, ConnectionStatus::Connecting);
        let second = manager.on_event(events.connection.recv().await.unwrap());
        assert_eq!(
            second,
            Some(Transition::Disconnected {
                retry_in: Some(Duration::from_millis(200))
            })
        );
        let third = manager.on_event(events.connection.recv().await.unwrap());
        assert!(matches!(third, Some(Transition::Connected { .. })));
        assert_eq!(store.connect_count(), 3);
    }

    #[tokio_timeout_test(10)]
    async fn rejected_token_is_forgotten() {
        let store = MemoryStore::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        credentials
            .save("canvas@127.0.0.1:3000", "stale-token")
            .unwrap();
        let policy = ReconnectPolicy {
            base: Duration::from_millis(1),
            jitter: false,
            ..ReconnectPolicy::default()
        };
        let (mut manager, mut events) = manager(&store, credentials.clone(), policy);
        let cached = manager.cached_token(&endpoint(), "canvas");
        assert_eq!(cached.as_deref(), Some("stale-token"));
        manager.start(endpoint(), "canvas", cached);

        let failed = manager.on_event(events.connection.recv().await.unwrap());
        assert!(matches!(failed, Some(Transition::Disconnected { .. })));
        assert_eq!(manager.session().auth_token, None);

        let connected = manager.on_event(events.connection.recv().await.unwrap());
        assert!(matches!(connected, Some(Transition::Connected { .. })));
        let fresh = credentials.load("canvas@127.0.0.1:3000").unwrap().unwrap();
        assert_ne!(fresh, "stale-token");
    }

    #[tokio_timeout_test(10)]
    async fn link_rows_are_demultiplexed_by_table() {
        let store = MemoryStore::new();
        let (mut manager, mut events) = manager(
            &store,
            Arc::new(MemoryCredentialStore::new()),
            ReconnectPolicy::disabled(),
        );
        manager.start(endpoint(), "canvas", None);
        manager.on_event(events.connection.recv().await.unwrap());

        let red = Pixel::new(3, 4, Color::rgb(0xFF, 0, 0), Identity::ANONYMOUS);
        store.insert(&red);
        manager
            .handle()
            .send(crate::protocol::ClientMessage::Subscribe {
                request_id: crate::protocol::RequestId(1),
                query: crate::protocol::PIXEL_QUERY.into(),
            })
            .unwrap();
        assert_eq!(
            events.rows.recv().await,
            Some(RowEvent::Insert {
                generation: manager.generation(),
                pixel: red.clone(),
            })
        );
        assert!(matches!(
            events.subscriptions.recv().await,
            Some(SubscriptionEvent::Applied { .. })
        ));
    }

    #[tokio_timeout_test(10)]
    async fn lost_link_detaches_and_close_suppresses_retry() {
        let store = MemoryStore::new();
        let policy = ReconnectPolicy {
            base: Duration::from_millis(1),
            jitter: false,
            ..ReconnectPolicy::default()
        };
        let (mut manager, mut events) =
            manager(&store, Arc::new(MemoryCredentialStore::new()), policy);
        manager.start(endpoint(), "canvas", None);
        manager.on_event(events.connection.recv().await.unwrap());
        assert!(manager.handle().is_connected());

        store.drop_all();
        let lost = manager.on_event(events.connection.recv().await.unwrap());
        assert!(matches!(
            lost,
            Some(Transition::Disconnected { retry_in: Some(_) })
        ));
        assert!(!manager.handle().is_connected());
        assert_eq!(manager.handle().identity(), None);

        manager.close();
        // The pending attempt reports under a stale generation and is ignored.
        let stale = events.connection.recv().await.unwrap();
        assert_eq!(manager.on_event(stale), None);
        assert_eq!(manager.session().status, ConnectionStatus::Disconnected);
    }
}
