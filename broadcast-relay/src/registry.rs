//! Connection registry: the single authoritative record of who is connected.
//!
//! All membership changes go through [`Registry::admit`] and
//! [`Registry::evict`]. Every operation takes the same mutex, holds it only
//! for map access plus at most one non-blocking enqueue, and never across an
//! `.await`, so a slow client can never stall admissions or other recipients.
//!
//! Members live in a `BTreeMap` keyed by [`ConnectionId`]. Ids are handed out
//! in increasing order, so [`Registry::snapshot`] is naturally ordered by
//! admission time.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::{
    config::RelayConfig,
    connection::{Connection, ConnectionId, ConnectionState, Outbox},
    error::RelayError,
    message::Frame,
};

pub struct Registry {
    inner: Mutex<Members>,
    max_connections: usize,
    outbound_queue_capacity: usize,
}

struct Members {
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
}

impl Registry {
    /// Fails with [`RelayError::ZeroQueueCapacity`] if `outbound_queue_capacity`
    /// is zero.
    pub fn new(
        max_connections: usize,
        outbound_queue_capacity: usize,
    ) -> Result<Self, RelayError> {
        if outbound_queue_capacity == 0 {
            return Err(RelayError::ZeroQueueCapacity);
        }
        Ok(Self {
            inner: Mutex::new(Members {
                connections: BTreeMap::new(),
                next_id: 1,
            }),
            max_connections,
            outbound_queue_capacity,
        })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self, RelayError> {
        Self::new(config.max_connections, config.outbound_queue_capacity)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Admits a new connection and returns the transport side of its queue.
    ///
    /// Fails with [`RelayError::ResourceExhausted`] when the registry is full;
    /// membership is left untouched in that case and the caller must reject
    /// the handshake.
    pub fn admit(&self) -> Result<Outbox, RelayError> {
        let mut members = self.lock();
        if members.connections.len() >= self.max_connections {
            return Err(RelayError::ResourceExhausted {
                limit: self.max_connections,
            });
        }

        let id = ConnectionId::new(members.next_id);
        members.next_id += 1;

        let (connection, outbox) = Connection::open(id, self.outbound_queue_capacity);
        members.connections.insert(id, connection);
        debug!(connection = %id, members = members.connections.len(), "connection admitted");
        Ok(outbox)
    }

    /// Removes a connection. Evicting an absent id is a no-op.
    ///
    /// Returns `true` if the connection was a member. Its outbox keeps
    /// yielding the frames queued so far and then ends.
    pub fn evict(&self, id: ConnectionId) -> bool {
        let removed = self.lock().connections.remove(&id);
        match removed {
            Some(connection) => {
                connection.begin_close();
                debug!(connection = %id, "connection evicted");
                true
            }
            None => false,
        }
    }

    /// Ids of every open connection at this instant, in admission order.
    pub fn snapshot(&self) -> Vec<ConnectionId> {
        let members = self.lock();
        let ids: Vec<ConnectionId> = members.connections.keys().copied().collect();
        debug_assert!(
            members
                .connections
                .values()
                .all(|connection| connection.state() == ConnectionState::Open),
            "registry holds a connection that is not open"
        );
        ids
    }

    /// Queues `frame` for `id` without waiting.
    ///
    /// Fails with [`RelayError::NotFound`] if `id` is not a member (including
    /// when its transport already went away) and with
    /// [`RelayError::QueueFull`] if its outbound queue is at capacity.
    pub fn send(&self, id: ConnectionId, frame: Frame) -> Result<(), RelayError> {
        let members = self.lock();
        let connection = members
            .connections
            .get(&id)
            .ok_or(RelayError::NotFound(id))?;

        match connection.try_enqueue(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RelayError::QueueFull(connection.id())),
            Err(TrySendError::Closed(_)) => Err(RelayError::NotFound(connection.id())),
        }
    }

    /// Evicts every member. Used at shutdown.
    pub fn close_all(&self) -> usize {
        let drained = std::mem::take(&mut self.lock().connections);
        let count = drained.len();
        for connection in drained.into_values() {
            connection.begin_close();
        }
        count
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        // A poisoned lock means a panic mid-mutation; the membership can no
        // longer be trusted, so take the process down with it.
        self.inner.lock().expect("connection registry lock poisoned")
    }
}
