//! The client engine: one task owns the replica and serializes every network
//! event and command, publishing a [`CanvasView`] after each step.

use image::RgbaImage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::Config;
use crate::connection::{ConnectionHandle, ConnectionManager, ReconnectPolicy, Transition};
use crate::event::{
    self, ConnectionEvent, DEFAULT_CHANNEL_CAPACITY, EventReceivers, Generation, ReducerEvent,
    RowEvent, SubscriptionEvent,
};
use crate::input::{InputConfig, InputController, InputError};
use crate::model::{Color, Identity, Pixel, SharedSelection};
use crate::protocol::ReducerStatus;
use crate::render::{RenderLoop, SurfaceSize};
use crate::replica::{ReplicaStore, StalePolicy};
use crate::session::{ConnectionStatus, CredentialStore};
use crate::subscription::{self, SubscriptionCoordinator, SubscriptionUpdate};
use crate::telemetry::{self, PerfGuard};
use crate::transport::Connector;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client event loop has stopped")]
    Stopped,
    #[error(transparent)]
    Input(#[from] InputError),
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub endpoint: Url,
    pub module: String,
    pub queries: Vec<String>,
    pub reconnect: ReconnectPolicy,
    pub stale_policy: StalePolicy,
    pub surface: SurfaceSize,
    pub channel_capacity: usize,
    pub input: InputConfig,
}

impl ClientConfig {
    pub fn new(endpoint: Url, module: impl Into<String>) -> Self {
        Self {
            endpoint,
            module: module.into(),
            queries: subscription::default_queries(),
            reconnect: ReconnectPolicy::default(),
            stale_policy: StalePolicy::default(),
            surface: SurfaceSize::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            input: InputConfig::default(),
        }
    }
}

impl From<&Config> for ClientConfig {
    fn from(config: &Config) -> Self {
        Self::new(config.endpoint.clone(), config.module.clone())
    }
}

/// Read-only snapshot for the presentation layer.
#[derive(Clone, Debug)]
pub struct CanvasView {
    pub status: ConnectionStatus,
    pub identity: Option<Identity>,
    /// Every query of the current connection has delivered its initial rows.
    pub ready: bool,
    pub selected: Color,
    /// Live pixels in apply order.
    pub pixels: Arc<Vec<Pixel>>,
    pub frame: Arc<RgbaImage>,
    pub version: u64,
    pub generation: Generation,
    pub last_error: Option<String>,
    pub rejected_mutations: u64,
}

impl CanvasView {
    pub fn pixel_at(&self, x: i64, y: i64) -> Option<&Pixel> {
        self.pixels.iter().rev().find(|pixel| pixel.x == x && pixel.y == y)
    }
}

enum Command {
    Start,
    Close,
    Refresh,
    Shutdown(oneshot::Sender<()>),
}

pub struct CanvasClient {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<CanvasView>,
    handle: ConnectionHandle,
    selection: SharedSelection,
    input: InputConfig,
    task: JoinHandle<()>,
}

impl CanvasClient {
    /// Spawns the event loop on the current tokio runtime. Nothing connects
    /// until [`CanvasClient::start`].
    pub fn spawn(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let (senders, receivers) = event::channels(config.channel_capacity);
        let (command_tx, command_rx) = mpsc::channel(32);
        let handle = ConnectionHandle::new();
        let selection = SharedSelection::default();
        let manager = ConnectionManager::new(
            connector,
            credentials,
            config.reconnect.clone(),
            senders,
            handle.clone(),
        );
        let replica = ReplicaStore::new(config.stale_policy);
        let renderer = RenderLoop::new(config.surface);
        let initial = CanvasView {
            status: ConnectionStatus::Disconnected,
            identity: None,
            ready: false,
            selected: selection.get(),
            pixels: Arc::new(Vec::new()),
            frame: renderer.frame(),
            version: replica.version(),
            generation: 0,
            last_error: None,
            rejected_mutations: 0,
        };
        let (view_tx, view_rx) = watch::channel(initial);
        let input = config.input.clone();

        let event_loop = EventLoop {
            config,
            manager,
            coordinator: SubscriptionCoordinator::new(),
            replica,
            renderer,
            selection: selection.clone(),
            view: view_tx,
            commands: command_rx,
            events: receivers,
            pixels: Arc::new(Vec::new()),
            rejected_mutations: 0,
        };
        let task = tokio::spawn(event_loop.run());

        Self {
            commands: command_tx,
            view: view_rx,
            handle,
            selection,
            input,
            task,
        }
    }

    /// Begins connecting, resuming the cached identity when a token is stored.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.command(Command::Start).await
    }

    /// Disconnects without reconnecting. The replica is kept.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.command(Command::Close).await
    }

    pub async fn shutdown(self) -> Result<(), ClientError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command(Command::Shutdown(ack_tx)).await?;
        let _ = ack_rx.await;
        self.task.await.map_err(|_| ClientError::Stopped)
    }

    pub fn view(&self) -> CanvasView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CanvasView> {
        self.view.clone()
    }

    /// Resolves with the first published view matching `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&CanvasView) -> bool,
    ) -> Result<CanvasView, ClientError> {
        let mut view = self.view.clone();
        let matched = view
            .wait_for(|current| predicate(current))
            .await
            .map_err(|_| ClientError::Stopped)?;
        Ok(matched.clone())
    }

    /// A gesture controller bound to the live connection and shared selection.
    pub fn input(&self) -> InputController {
        InputController::new(
            Arc::new(self.handle.clone()),
            self.selection.clone(),
            self.input.clone(),
        )
    }

    pub fn select_color(&self, raw: &str) -> Result<Color, ClientError> {
        let color = self.input().select_color(raw)?;
        let _ = self.commands.try_send(Command::Refresh);
        Ok(color)
    }

    async fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Stopped)
    }
}

struct EventLoop {
    config: ClientConfig,
    manager: ConnectionManager,
    coordinator: SubscriptionCoordinator,
    replica: ReplicaStore,
    renderer: RenderLoop,
    selection: SharedSelection,
    view: watch::Sender<CanvasView>,
    commands: mpsc::Receiver<Command>,
    events: EventReceivers,
    pixels: Arc<Vec<Pixel>>,
    rejected_mutations: u64,
}

impl EventLoop {
    async fn run(mut self) {
        debug!(target = "pixel_canvas::client", endpoint = %self.config.endpoint, module = %self.config.module, "event loop started");
        loop {
            // Rows are drained before subscription signals so that an applied
            // signal is never observed ahead of the rows it covers.
            tokio::select! {
                biased;
                Some(event) = self.events.rows.recv() => self.on_row(event),
                Some(event) = self.events.subscriptions.recv() => self.on_subscription(event),
                Some(event) = self.events.connection.recv() => self.on_connection(event),
                Some(event) = self.events.reducers.recv() => self.on_reducer(event),
                command = self.commands.recv() => match command {
                    Some(Command::Start) => self.start(),
                    Some(Command::Close) => self.manager.close(),
                    Some(Command::Refresh) => {}
                    Some(Command::Shutdown(ack)) => {
                        self.stop();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.stop();
                        break;
                    }
                },
            }
            self.publish();
        }
    }

    fn start(&mut self) {
        let endpoint = self.config.endpoint.clone();
        let module = self.config.module.clone();
        let cached = self.manager.cached_token(&endpoint, &module);
        info!(target = "pixel_canvas::client", endpoint = %endpoint, module = %module, resume = cached.is_some(), "connecting");
        self.manager.start(endpoint, module, cached);
    }

    fn stop(&mut self) {
        self.manager.close();
        self.publish();
        telemetry::report();
        debug!(target = "pixel_canvas::client", "event loop stopped");
    }

    fn on_row(&mut self, event: RowEvent) {
        let _guard = PerfGuard::new("apply_row");
        apply_row(&mut self.replica, event, self.manager.generation());
    }

    fn on_subscription(&mut self, event: SubscriptionEvent) {
        match self.coordinator.on_event(event) {
            Some(SubscriptionUpdate::Ready) => self.on_ready(),
            Some(SubscriptionUpdate::Rejected { .. }) | None => {}
        }
    }

    fn on_ready(&mut self) {
        let pruned = self.replica.finish_resync();
        if pruned > 0 {
            info!(target = "pixel_canvas::client", pruned, "dropped cells not redelivered after resubscribe");
        }
        telemetry::record_gauge("replica_pixels", self.replica.len() as u64);
    }

    fn on_connection(&mut self, event: ConnectionEvent) {
        match self.manager.on_event(event) {
            Some(Transition::Connected { generation }) => {
                self.replica.begin_resync();
                match self.coordinator.subscribe(
                    self.manager.handle(),
                    generation,
                    &self.config.queries,
                ) {
                    Ok(true) => self.on_ready(),
                    Ok(false) => {}
                    Err(err) => {
                        warn!(target = "pixel_canvas::client", error = %err, "failed to issue subscriptions")
                    }
                }
            }
            Some(Transition::Disconnected { retry_in }) => {
                debug!(target = "pixel_canvas::client", retry_in = ?retry_in, "disconnected");
            }
            Some(Transition::Failed) | None => {}
        }
    }

    fn on_reducer(&mut self, event: ReducerEvent) {
        match event.status {
            ReducerStatus::Committed => {
                trace!(target = "pixel_canvas::client", request_id = %event.request_id, reducer = %event.reducer, "mutation committed");
            }
            ReducerStatus::Failed | ReducerStatus::OutOfEnergy => {
                self.rejected_mutations += 1;
                warn!(
                    target = "pixel_canvas::client",
                    request_id = %event.request_id,
                    reducer = %event.reducer,
                    status = ?event.status,
                    message = event.message.as_deref().unwrap_or(""),
                    "mutation rejected"
                );
            }
        }
    }

    fn publish(&mut self) {
        if self.renderer.render(&mut self.replica) {
            self.pixels = Arc::new(self.replica.snapshot());
        }
        let session = self.manager.session();
        let status = session.status;
        let next = CanvasView {
            status,
            identity: session.identity,
            ready: status == ConnectionStatus::Connected
                && self.coordinator.is_ready()
                && self.coordinator.generation() == self.manager.generation(),
            selected: self.selection.get(),
            pixels: self.pixels.clone(),
            frame: self.renderer.frame(),
            version: self.replica.version(),
            generation: self.manager.generation(),
            last_error: self.manager.last_error().map(str::to_string),
            rejected_mutations: self.rejected_mutations,
        };
        self.view.send_if_modified(|current| {
            let changed = current.status != next.status
                || current.identity != next.identity
                || current.ready != next.ready
                || current.selected != next.selected
                || current.version != next.version
                || current.generation != next.generation
                || current.last_error != next.last_error
                || current.rejected_mutations != next.rejected_mutations
                || !Arc::ptr_eq(&current.frame, &next.frame);
            if changed {
                *current = next;
            }
            changed
        });
    }
}

/// Rows from every link are applied, but only rows from the `current` link
/// count toward the resync in progress.
fn apply_row(replica: &mut ReplicaStore, event: RowEvent, current: Generation) {
    match event {
        RowEvent::Insert { generation, pixel } => {
            trace!(target = "pixel_canvas::client", generation, x = pixel.x, y = pixel.y, color = %pixel.color, "apply insert");
            if generation == current {
                replica.apply_insert(pixel);
            } else {
                replica.apply_superseded_insert(pixel);
            }
        }
        RowEvent::Delete { key, .. } => {
            if replica.apply_delete(key).is_some() {
                trace!(target = "pixel_canvas::client", x = key.x, y = key.y, "apply delete");
            }
        }
    }
}
