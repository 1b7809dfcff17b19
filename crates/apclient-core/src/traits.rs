//! Core traits for device access and persistence.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Address in the device's negotiated address space.
pub type Address = u32;

/// Session connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No socket is open.
    #[default]
    Disconnected,
    /// Socket opened, waiting for `Connected`.
    Connecting,
    /// Authenticated with the server.
    Connected,
    /// Credentials were rejected; automatic reconnection is suppressed.
    AuthError,
}

/// Device error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("Device unavailable: {0}")]
    Unavailable(String),
    #[error("Device request timed out")]
    Timeout,
    #[error("No device selected")]
    NoDevice,
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

/// Byte-addressable memory exposed by the running game.
///
/// Implementations never retry. A failed request surfaces as a
/// [`DeviceError`] and retry policy is left to the caller.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Read `length` bytes starting at `address`.
    async fn read(&self, address: Address, length: usize) -> Result<Vec<u8>, DeviceError>;

    /// Write `data` starting at `address`.
    async fn write(&self, address: Address, data: &[u8]) -> Result<(), DeviceError>;
}

/// Discovers and attaches devices.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// List the names of currently reachable devices.
    async fn list_devices(&self) -> Result<Vec<String>, DeviceError>;

    /// Attach to a device by name.
    async fn attach(&self, device: &str) -> Result<Arc<dyn DeviceBridge>, DeviceError>;
}

/// Persisted data package payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDataPackage {
    /// Server-reported version. Never zero.
    pub version: i64,
    /// Raw `data` object of the `DataPackage` command.
    pub payload: Value,
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for the client's local persistence.
#[async_trait]
pub trait ClientStorage: Send + Sync {
    /// Load the cached data package, if any.
    async fn load_data_package(&self) -> Result<Option<StoredDataPackage>, StorageError>;

    /// Replace the cached data package.
    async fn save_data_package(&self, package: &StoredDataPackage) -> Result<(), StorageError>;

    /// Stable client identity, created on first use.
    async fn client_id(&self) -> Result<String, StorageError>;
}
