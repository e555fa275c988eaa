//! Event categories flowing from the network side into the client event loop.
//!
//! Each category gets its own bounded channel so consumers can be driven and
//! tested independently, and so an event sequence can be recorded and replayed.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::model::{CoordinateKey, Pixel};
use crate::protocol::{ReducerStatus, RequestId};
use crate::transport::{Handshake, Outbound, TransportError};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Identifies one connection attempt; events from older generations are stale.
pub type Generation = u64;

pub enum ConnectionEvent {
    Established {
        generation: Generation,
        handshake: Handshake,
        outbound: Arc<dyn Outbound>,
    },
    Failed {
        generation: Generation,
        error: TransportError,
    },
    Lost {
        generation: Generation,
    },
}

impl ConnectionEvent {
    pub fn generation(&self) -> Generation {
        match self {
            ConnectionEvent::Established { generation, .. }
            | ConnectionEvent::Failed { generation, .. }
            | ConnectionEvent::Lost { generation } => *generation,
        }
    }
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::Established {
                generation,
                handshake,
                ..
            } => f
                .debug_struct("Established")
                .field("generation", generation)
                .field("identity", &handshake.identity)
                .finish(),
            ConnectionEvent::Failed { generation, error } => f
                .debug_struct("Failed")
                .field("generation", generation)
                .field("error", error)
                .finish(),
            ConnectionEvent::Lost { generation } => {
                f.debug_struct("Lost").field("generation", generation).finish()
            }
        }
    }
}

/// A row change, tagged with the link it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowEvent {
    Insert { generation: Generation, pixel: Pixel },
    Delete { generation: Generation, key: CoordinateKey },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Applied {
        generation: Generation,
        request_id: RequestId,
    },
    Failed {
        generation: Generation,
        request_id: RequestId,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducerEvent {
    pub request_id: RequestId,
    pub reducer: String,
    pub status: ReducerStatus,
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct EventSenders {
    pub connection: mpsc::Sender<ConnectionEvent>,
    pub rows: mpsc::Sender<RowEvent>,
    pub subscriptions: mpsc::Sender<SubscriptionEvent>,
    pub reducers: mpsc::Sender<ReducerEvent>,
}

pub struct EventReceivers {
    pub connection: mpsc::Receiver<ConnectionEvent>,
    pub rows: mpsc::Receiver<RowEvent>,
    pub subscriptions: mpsc::Receiver<SubscriptionEvent>,
    pub reducers: mpsc::Receiver<ReducerEvent>,
}

pub fn channels(capacity: usize) -> (EventSenders, EventReceivers) {
    let capacity = capacity.max(1);
    let (connection_tx, connection_rx) = mpsc::channel(capacity);
    let (rows_tx, rows_rx) = mpsc::channel(capacity);
    let (subscriptions_tx, subscriptions_rx) = mpsc::channel(capacity);
    let (reducers_tx, reducers_rx) = mpsc::channel(capacity);
    (
        EventSenders {
            connection: connection_tx,
            rows: rows_tx,
            subscriptions: subscriptions_tx,
            reducers: reducers_tx,
        },
        EventReceivers {
            connection: connection_rx,
            rows: rows_rx,
            subscriptions: subscriptions_rx,
            reducers: reducers_rx,
        },
    )
}
