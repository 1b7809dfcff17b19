//! Session server transport.
//!
//! Provides:
//! - Wire protocol (JSON command batches tagged by `cmd`)
//! - Server address normalisation
//! - Socket handle and event types
//! - WebSocket transport (feature: websocket)

pub mod address;
pub mod protocol;
pub mod socket;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use address::{DEFAULT_SERVER_PORT, normalize_address};
pub use protocol::{
    ClientCommand, ClientStatus, DataPackageData, GameData, NetworkItem, NetworkPlayer,
    NetworkVersion, ProtocolError, RoomFields, ServerCommand, decode_batch, encode_batch,
};
pub use socket::{CloseReason, ConnectionId, Outbound, SendError, SocketEvent, SocketHandle};
