use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::event::Generation;
use crate::input::MutationSink;
use crate::model::{Identity, NewPixel};
use crate::protocol::{ClientMessage, RequestId};
use crate::transport::{Outbound, TransportError};

#[derive(Default)]
struct LinkSlot {
    outbound: Option<Arc<dyn Outbound>>,
    identity: Option<Identity>,
    generation: Generation,
}

/// Cheap, cloneable view of the live link. Written only by the connection
/// manager; read by the subscription coordinator and input controller.
#[derive(Clone, Default)]
pub struct ConnectionHandle {
    slot: Arc<RwLock<LinkSlot>>,
    next_request: Arc<AtomicU32>,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(
        &self,
        generation: Generation,
        identity: Identity,
        outbound: Arc<dyn Outbound>,
    ) {
        let mut slot = self.slot.write();
        slot.outbound = Some(outbound);
        slot.identity = Some(identity);
        slot.generation = generation;
    }

    pub(crate) fn detach(&self) -> Option<Arc<dyn Outbound>> {
        let mut slot = self.slot.write();
        slot.identity = None;
        slot.outbound.take()
    }

    pub fn generation(&self) -> Generation {
        self.slot.read().generation
    }

    pub fn is_connected(&self) -> bool {
        self.slot
            .read()
            .outbound
            .as_ref()
            .map(|outbound| outbound.is_open())
            .unwrap_or(false)
    }

    /// Identity of the live session; `None` while disconnected.
    pub fn identity(&self) -> Option<Identity> {
        let slot = self.slot.read();
        match &slot.outbound {
            Some(outbound) if outbound.is_open() => slot.identity,
            _ => None,
        }
    }

    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        let outbound = self
            .slot
            .read()
            .outbound
            .clone()
            .ok_or(TransportError::NotConnected)?;
        outbound.send(message)
    }
}

impl MutationSink for ConnectionHandle {
    fn identity(&self) -> Option<Identity> {
        ConnectionHandle::identity(self)
    }

    fn send_pixel(&self, pixel: NewPixel) -> Result<RequestId, TransportError> {
        let request_id = self.next_request_id();
        let message = ClientMessage::send_pixel(request_id, &pixel)?;
        self.send(message)?;
        Ok(request_id)
    }
}
