//! JSON file client storage (feature-gated).

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use apclient_core::{ClientStorage, StorageError, StoredDataPackage};
use async_trait::async_trait;

use super::new_client_id;

const DATA_PACKAGE_FILE: &str = "datapackage.json";
const CLIENT_ID_FILE: &str = "client_id";

/// File storage implementation.
///
/// Keeps one JSON file for the data package and one text file for the
/// client identity under a data directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create storage rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Platform data directory for the client, e.g. `~/.local/share/apclient`.
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("apclient"))
    }

    /// Storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_optional(&self, name: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.dir.join(name)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, name: &str, contents: &str) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl ClientStorage for FileStorage {
    async fn load_data_package(&self) -> Result<Option<StoredDataPackage>, StorageError> {
        let Some(contents) = self.read_optional(DATA_PACKAGE_FILE).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn save_data_package(&self, package: &StoredDataPackage) -> Result<(), StorageError> {
        let contents = serde_json::to_string(package)?;
        self.write(DATA_PACKAGE_FILE, &contents).await
    }

    async fn client_id(&self) -> Result<String, StorageError> {
        if let Some(id) = self.read_optional(CLIENT_ID_FILE).await? {
            let id = id.trim();
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }
        let id = new_client_id();
        self.write(CLIENT_ID_FILE, &id).await?;
        tracing::info!(dir = %self.dir.display(), "Created client identity");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested");

        let storage = FileStorage::new(&dir);
        assert!(storage.load_data_package().await.unwrap().is_none());
        let id = storage.client_id().await.unwrap();
        let package = StoredDataPackage {
            version: 9,
            payload: serde_json::json!({"games": {"Super Metroid": {}}}),
        };
        storage.save_data_package(&package).await.unwrap();

        let reopened = FileStorage::new(&dir);
        assert_eq!(reopened.client_id().await.unwrap(), id);
        assert_eq!(reopened.load_data_package().await.unwrap(), Some(package));
    }

    #[tokio::test]
    async fn test_corrupt_package_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join(DATA_PACKAGE_FILE), "{not json")
            .await
            .unwrap();
        let storage = FileStorage::new(tmp.path());
        assert!(matches!(
            storage.load_data_package().await,
            Err(StorageError::Json(_))
        ));
    }
}
