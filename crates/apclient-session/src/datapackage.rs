//! Id to name lookup built from the server's data package.

use std::collections::HashMap;

use apclient_core::StoredDataPackage;
use apclient_transport::DataPackageData;

/// Version marking a custom package that is never persisted.
pub const UNVERSIONED: i64 = 0;

/// Derived id→name maps for every game in the package.
#[derive(Debug, Clone, Default)]
pub struct DataPackageCache {
    version: Option<i64>,
    items: HashMap<i64, String>,
    locations: HashMap<i64, String>,
}

impl DataPackageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the stored package must be re-fetched for `server_version`.
    ///
    /// A package is stale when nothing is stored, when the server reports
    /// no version or the unversioned sentinel, or when versions differ.
    #[must_use]
    pub fn is_stale(stored: Option<&StoredDataPackage>, server_version: Option<i64>) -> bool {
        match (stored, server_version) {
            (Some(stored), Some(version)) => version == UNVERSIONED || stored.version != version,
            _ => true,
        }
    }

    /// Replace the maps with those derived from `data`.
    pub fn rebuild(&mut self, data: &DataPackageData, version: i64) {
        self.items.clear();
        self.locations.clear();
        for game in data.games.values() {
            for (name, id) in &game.item_name_to_id {
                self.items.insert(*id, name.clone());
            }
            for (name, id) in &game.location_name_to_id {
                self.locations.insert(*id, name.clone());
            }
        }
        self.version = Some(version);
        tracing::debug!(
            version,
            items = self.items.len(),
            locations = self.locations.len(),
            "Rebuilt data package maps"
        );
    }

    /// Version the maps were built from.
    #[must_use]
    pub const fn version(&self) -> Option<i64> {
        self.version
    }

    #[must_use]
    pub fn item_name(&self, id: i64) -> Option<&str> {
        self.items.get(&id).map(String::as_str)
    }

    #[must_use]
    pub fn location_name(&self, id: i64) -> Option<&str> {
        self.locations.get(&id).map(String::as_str)
    }
}
