//! Broadcast + history feed of user-facing console messages.

use std::{collections::VecDeque, sync::RwLock};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::ConnectionStatus;

/// Default history size limit (1 MB).
const HISTORY_BYTES: usize = 1024 * 1024;

/// A message shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ConsoleMsg {
    /// Client-generated status text.
    Info(String),
    /// Client-generated failure text.
    Error(String),
    /// Server `Print`.
    Print(String),
    /// Server `PrintJSON`, rendered to text, with the raw parts.
    PrintJson { text: String, data: Value },
    /// Connection status changed.
    Status(ConnectionStatus),
}

impl ConsoleMsg {
    /// Plain text form of the message.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Info(s) | Self::Error(s) | Self::Print(s) => s.clone(),
            Self::PrintJson { text, .. } => text.clone(),
            Self::Status(status) => match status {
                ConnectionStatus::Disconnected => "Not Connected".to_string(),
                ConnectionStatus::Connecting => "Connecting".to_string(),
                ConnectionStatus::Connected => "Connected".to_string(),
                ConnectionStatus::AuthError => "Authentication Failed".to_string(),
            },
        }
    }

    fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 8;
        match self {
            Self::Info(s) | Self::Error(s) | Self::Print(s) => s.len() + OVERHEAD,
            Self::PrintJson { text, data } => text.len() * 2 + data.to_string().len() + OVERHEAD,
            Self::Status(_) => OVERHEAD,
        }
    }
}

#[derive(Clone)]
struct StoredMsg {
    msg: ConsoleMsg,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
}

/// Console feed with broadcast and history support.
///
/// A front end attaching late receives the history first, then live
/// messages.
pub struct ConsoleStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<ConsoleMsg>,
}

impl Default for ConsoleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleStore {
    /// Create a new console store.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
        }
    }

    /// Push a message to both live listeners and history.
    pub fn push(&self, msg: ConsoleMsg) {
        let _ = self.sender.send(msg.clone()); // live listeners
        let bytes = msg.approx_bytes();

        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredMsg { msg, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Push an informational message.
    pub fn info<S: Into<String>>(&self, s: S) {
        self.push(ConsoleMsg::Info(s.into()));
    }

    /// Push an error message.
    pub fn error<S: Into<String>>(&self, s: S) {
        self.push(ConsoleMsg::Error(s.into()));
    }

    /// Push a connection status change.
    pub fn status(&self, status: ConnectionStatus) {
        self.push(ConsoleMsg::Status(status));
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<ConsoleMsg> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<ConsoleMsg> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.history.iter().map(|s| s.msg.clone()).collect()
    }

    /// Stream that yields history first, then live updates.
    ///
    /// Live messages that lag behind the channel capacity are dropped.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, ConsoleMsg> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
