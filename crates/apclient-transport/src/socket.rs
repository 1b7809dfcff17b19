//! Transport-neutral socket handle and event types.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use tokio::sync::mpsc;

use crate::protocol::{ClientCommand, ServerCommand};

/// Identifies one connection attempt.
///
/// Events from a superseded connection carry an old id and can be ignored.
pub type ConnectionId = u64;

/// Why a socket closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by either side without error.
    Normal,
    /// Connect failed or the stream errored.
    Error(String),
}

/// Event delivered by a socket's I/O task.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// The socket is open and ready to send.
    Opened(ConnectionId),
    /// An inbound batch of commands.
    Batch(ConnectionId, Vec<ServerCommand>),
    /// The socket closed. No further events follow for this id.
    Closed(ConnectionId, CloseReason),
}

impl SocketEvent {
    /// Connection the event belongs to.
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        match self {
            Self::Opened(id) | Self::Batch(id, _) | Self::Closed(id, _) => *id,
        }
    }
}

/// Request to a socket's I/O task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Send one frame.
    Batch(Vec<ClientCommand>),
    /// Close the socket.
    Close,
}

/// Send error.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Socket closed")]
    Closed,
}

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

/// Handle to an open (or opening) session socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
    state: Arc<AtomicU8>,
}

impl SocketHandle {
    /// Create a handle wired to a caller-owned receiver.
    ///
    /// The handle starts open. Used by transports and tests.
    #[must_use]
    pub fn detached(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self::connecting(id, tx);
        handle.state.store(OPEN, Ordering::Release);
        (handle, rx)
    }

    pub(crate) fn connecting(id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            tx,
            state: Arc::new(AtomicU8::new(CONNECTING)),
        }
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the socket is open for sending.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN && !self.tx.is_closed()
    }

    /// Send a single command.
    ///
    /// # Errors
    /// Returns error if the socket is not open.
    pub fn send(&self, command: ClientCommand) -> Result<(), SendError> {
        self.send_batch(vec![command])
    }

    /// Send several commands in one frame.
    ///
    /// # Errors
    /// Returns error if the socket is not open.
    pub fn send_batch(&self, commands: Vec<ClientCommand>) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.tx
            .send(Outbound::Batch(commands))
            .map_err(|_| SendError::Closed)
    }

    /// Close the socket, including one that is still connecting.
    /// Idempotent.
    pub fn close(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    /// Move from connecting to open. Fails if a close was requested.
    #[cfg_attr(not(feature = "websocket"), allow(dead_code))]
    pub(crate) fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(CONNECTING, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cfg_attr(not(feature = "websocket"), allow(dead_code))]
    pub(crate) fn mark_closed(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }
}
