use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::mpsc;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized `ChatEvent`
    Event(String),
    /// Close the transport with the given reason
    Close(String),
}

/// Cheap, cloneable reference to a live connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    resource_id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn resource_id(&self) -> u64 {
        self.resource_id
    }

    pub fn resource_label(&self) -> String {
        self.resource_id.to_string()
    }

    /// Returns false once the writer side has gone away.
    pub fn send(&self, payload: impl Into<String>) -> bool {
        self.tx.send(Outbound::Event(payload.into())).is_ok()
    }

    pub fn close(&self, reason: impl Into<String>) -> bool {
        self.tx.send(Outbound::Close(reason.into())).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    AlreadyBound,
}

struct LocalConnection {
    handle: ConnectionHandle,
    session_id: String,
}

/// Process-local map of live connections to the session each one is bound to.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<u64, LocalConnection>,
    next_resource_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a resource id and outbound queue for a freshly accepted transport.
    /// The connection is not visible to fan-out until it is bound.
    pub fn open(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let resource_id = self.next_resource_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle { resource_id, tx }, rx)
    }

    pub fn bind(&self, handle: &ConnectionHandle, session_id: &str) -> Result<(), BindError> {
        match self.connections.entry(handle.resource_id) {
            Entry::Occupied(_) => Err(BindError::AlreadyBound),
            Entry::Vacant(entry) => {
                entry.insert(LocalConnection {
                    handle: handle.clone(),
                    session_id: session_id.to_string(),
                });
                Ok(())
            }
        }
    }

    pub fn session_of(&self, resource_id: u64) -> Option<String> {
        self.connections
            .get(&resource_id)
            .map(|entry| entry.session_id.clone())
    }

    /// Remove the connection, returning the session it was bound to.
    pub fn unbind(&self, resource_id: u64) -> Option<String> {
        self.connections
            .remove(&resource_id)
            .map(|(_, connection)| connection.session_id)
    }

    pub fn find(&self, resource_id: u64) -> Option<(ConnectionHandle, String)> {
        self.connections
            .get(&resource_id)
            .map(|entry| (entry.handle.clone(), entry.session_id.clone()))
    }

    /// Visit every bound connection. Iteration order is unspecified.
    pub fn for_each_local<F>(&self, mut f: F)
    where
        F: FnMut(&ConnectionHandle, &str),
    {
        for entry in self.connections.iter() {
            f(&entry.handle, &entry.session_id);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
