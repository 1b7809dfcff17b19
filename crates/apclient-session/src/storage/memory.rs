//! In-memory client storage.

use std::sync::RwLock;

use apclient_core::{ClientStorage, StorageError, StoredDataPackage};
use async_trait::async_trait;

use super::new_client_id;

/// In-memory storage implementation.
///
/// Useful for development and tests.
/// Data is lost on restart.
pub struct MemoryStorage {
    data_package: RwLock<Option<StoredDataPackage>>,
    client_id: RwLock<Option<String>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data_package: RwLock::new(None),
            client_id: RwLock::new(None),
        }
    }

    /// Create storage that already holds a data package.
    #[must_use]
    pub const fn with_data_package(package: StoredDataPackage) -> Self {
        Self {
            data_package: RwLock::new(Some(package)),
            client_id: RwLock::new(None),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientStorage for MemoryStorage {
    async fn load_data_package(&self) -> Result<Option<StoredDataPackage>, StorageError> {
        Ok(self
            .data_package
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .clone())
    }

    async fn save_data_package(&self, package: &StoredDataPackage) -> Result<(), StorageError> {
        *self
            .data_package
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))? = Some(package.clone());
        Ok(())
    }

    async fn client_id(&self) -> Result<String, StorageError> {
        let mut id = self
            .client_id
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(id.get_or_insert_with(new_client_id).clone())
    }
}
