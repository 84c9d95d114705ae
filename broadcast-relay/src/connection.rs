//! Per-connection identity, lifecycle state and outbound queue.
//!
//! A connection is split in two halves when it is admitted:
//!
//! - [`Connection`] stays inside the registry and owns the sending end of the
//!   bounded outbound queue.
//! - [`Outbox`] is handed to the transport, which drains it in insertion order
//!   and writes each frame to the socket.
//!
//! Both halves share one atomic state cell so the transport can observe an
//! eviction and the registry never has to reach into the transport.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use tokio::sync::mpsc;

use crate::message::Frame;

/// Identifier assigned to a connection at admission. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a connection.
///
/// `Open -> Closing -> Closed` is the only path. A connection is a registry
/// member exactly while it is `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Member of the registry, eligible for broadcasts.
    Open = 0,
    /// Evicted; the transport is flushing whatever was already queued.
    Closing = 1,
    /// Outbox drained and the transport is done with it.
    Closed = 2,
}

impl ConnectionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Open, ConnectionState::Closing)
                | (ConnectionState::Closing, ConnectionState::Closed)
        )
    }
}

#[derive(Debug, Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn open() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Open as u8)))
    }

    fn load(&self) -> ConnectionState {
        ConnectionState::from_raw(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Registry-side half of a connection.
#[derive(Debug)]
pub(crate) struct Connection {
    id: ConnectionId,
    state: StateCell,
    outbound: mpsc::Sender<Frame>,
}

impl Connection {
    /// Creates an `Open` connection with a queue holding at most `capacity`
    /// frames. `capacity` must be non-zero; the registry guarantees it.
    pub(crate) fn open(id: ConnectionId, capacity: usize) -> (Self, Outbox) {
        let (outbound, inbound) = mpsc::channel(capacity);
        let state = StateCell::open();
        let connection = Self {
            id,
            state: state.clone(),
            outbound,
        };
        let outbox = Outbox {
            id,
            frames: inbound,
            state,
        };
        (connection, outbox)
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Enqueues without waiting. Fails when the queue is full or the
    /// transport has already dropped its outbox.
    pub(crate) fn try_enqueue(&self, frame: Frame) -> Result<(), mpsc::error::TrySendError<Frame>> {
        self.outbound.try_send(frame)
    }

    /// Moves the connection to `Closing` and drops the sender, so the outbox
    /// ends once the frames already queued are drained.
    pub(crate) fn begin_close(self) {
        self.state.transition(ConnectionState::Open, ConnectionState::Closing);
    }
}

/// Transport-side half of a connection: the receiving end of its outbound queue.
#[derive(Debug)]
pub struct Outbox {
    id: ConnectionId,
    frames: mpsc::Receiver<Frame>,
    state: StateCell,
}

impl Outbox {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Number of frames waiting to be written.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Next queued frame, in insertion order.
    ///
    /// Returns `None` after the connection has been evicted and every frame
    /// queued before the eviction has been handed out. The state is `Closed`
    /// from then on.
    pub async fn recv(&mut self) -> Option<Frame> {
        match self.frames.recv().await {
            Some(frame) => Some(frame),
            None => {
                self.finish();
                None
            }
        }
    }

    /// Non-blocking variant of [`Outbox::recv`]. `None` means nothing is
    /// queued right now or the outbox has finished.
    pub fn try_recv(&mut self) -> Option<Frame> {
        match self.frames.try_recv() {
            Ok(frame) => Some(frame),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.finish();
                None
            }
        }
    }

    fn finish(&mut self) {
        self.state.transition(ConnectionState::Closing, ConnectionState::Closed);
    }
}
