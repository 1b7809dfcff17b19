//! Core abstractions for the Archipelago Super Metroid client.
//!
//! This crate provides the fundamental building blocks:
//! - `DeviceBridge` / `DeviceConnector` - Byte-addressable game memory
//! - `ClientStorage` - Data package cache and client identity
//! - `ClientContext` - Game identity announced on connect
//! - `ConsoleStore` - Broadcast + history feed of user-facing messages

pub mod console;
pub mod context;
pub mod traits;

pub use console::{ConsoleMsg, ConsoleStore};
pub use context::{ClientContext, ProtocolVersion};
pub use traits::{
    Address, ClientStorage, ConnectionStatus, DeviceBridge, DeviceConnector, DeviceError,
    StorageError, StoredDataPackage,
};
