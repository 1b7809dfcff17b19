//! Session orchestration for the Archipelago Super Metroid client.
//!
//! Provides:
//! - `SessionClient` - Inbound command dispatch over `SessionState`
//! - `ReconciliationLoop` - Device polling tick
//! - `ReconnectSupervisor` - Bounded reconnection policy
//! - `ClientManager` - The coordinator owning all of the above
//! - Storage implementations (memory, file)

pub mod client;
pub mod config;
pub mod datapackage;
pub mod layout;
pub mod manager;
pub mod reconcile;
pub mod state;
pub mod storage;
pub mod supervisor;

pub use client::{Reaction, SEED_NAME_KEY, SessionClient};
pub use config::ClientConfig;
pub use datapackage::DataPackageCache;
pub use layout::MemoryLayout;
pub use manager::{
    ClientManager, DeviceState, ManagerError, SocketFactory, UserCommand, WebSocketFactory,
};
pub use reconcile::{ReconciliationLoop, TickGuard, TickReport};
pub use state::{
    LocationSet, ReceivedItemQueue, RoomSummary, ScoutedItem, ScoutedLocationMap, SessionState,
    SlotInfo,
};
pub use supervisor::{ReconnectSupervisor, RetryDecision};

#[cfg(feature = "memory")]
pub use storage::MemoryStorage;

#[cfg(feature = "file")]
pub use storage::FileStorage;
