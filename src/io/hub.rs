//! Connection Hub
//!
//! Keeps the set of live real-time clients and fans frames out to them.
//! Delivery is non-blocking: each client owns a bounded queue drained by its
//! own writer task, so one slow or dead socket never stalls the others.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A serialized message, shared by every recipient of one broadcast.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("client channel closed")]
    Closed,
    #[error("client queue full")]
    Full,
}

/// Anything that can accept a frame without blocking.
pub trait ClientSink: Send + Sync {
    fn deliver(&self, frame: Frame) -> Result<(), DeliveryError>;
}

impl ClientSink for mpsc::Sender<Frame> {
    fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

impl ClientSink for mpsc::UnboundedSender<Frame> {
    fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.send(frame).map_err(|_| DeliveryError::Closed)
    }
}

pub struct ConnectionHub {
    clients: Mutex<HashMap<ClientId, Box<dyn ClientSink>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `sink` and hands it `initial()` before any broadcast can reach it.
    ///
    /// `initial` runs while the client set is locked, so the first frame a
    /// client sees is never older than a broadcast it could miss.
    pub fn connect<S, F>(&self, sink: S, initial: F) -> Result<ClientId, DeliveryError>
    where
        S: ClientSink + 'static,
        F: FnOnce() -> Frame,
    {
        let mut clients = self.clients.lock();
        sink.deliver(initial())?;
        let id = ClientId::new();
        clients.insert(id, Box::new(sink));
        info!(client = %id, total = clients.len(), "client connected");
        Ok(id)
    }

    /// Safe to call repeatedly and from error paths.
    pub fn disconnect(&self, id: ClientId) -> bool {
        let mut clients = self.clients.lock();
        let removed = clients.remove(&id).is_some();
        if removed {
            info!(client = %id, remaining = clients.len(), "client disconnected");
        }
        removed
    }

    /// Delivers `frame` to every client; failing clients are dropped.
    /// Returns how many clients accepted the frame.
    pub fn broadcast(&self, frame: Frame) -> usize {
        let mut clients = self.clients.lock();
        let mut stale = Vec::new();
        for (id, sink) in clients.iter() {
            if let Err(e) = sink.deliver(frame.clone()) {
                warn!(client = %id, error = %e, "dropping client after failed delivery");
                stale.push(*id);
            }
        }
        for id in &stale {
            clients.remove(id);
        }
        let delivered = clients.len();
        debug!(delivered, dropped = stale.len(), "broadcast");
        delivered
    }

    /// Sends to one client, keeping its ordering relative to broadcasts.
    pub fn send_to(&self, id: ClientId, frame: Frame) -> bool {
        let mut clients = self.clients.lock();
        let Some(sink) = clients.get(&id) else {
            return false;
        };
        match sink.deliver(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(client = %id, error = %e, "dropping client after failed delivery");
                clients.remove(&id);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}
