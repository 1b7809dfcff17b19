//! Client identity announced to the session server.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl ProtocolVersion {
    /// Protocol version this client speaks.
    pub const CURRENT: Self = Self {
        major: 0,
        minor: 1,
        build: 9,
    };
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Identity sent with every `Connect`.
///
/// Apps may stash arbitrary metadata alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientContext {
    /// Game declared to the server.
    pub game: String,

    /// Tags sent with `Connect`.
    pub tags: Vec<String>,

    /// Protocol version sent with `Connect`.
    pub version: ProtocolVersion,

    /// Arbitrary metadata for app-specific needs.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Default for ClientContext {
    fn default() -> Self {
        Self::new("Super Metroid", ["Super Metroid Client"])
    }
}

impl ClientContext {
    /// Create a context for a game with the given tags.
    #[must_use]
    pub fn new<I>(game: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            game: game.into(),
            tags: tags.into_iter().map(Into::into).collect(),
            version: ProtocolVersion::CURRENT,
            metadata: HashMap::new(),
        }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}
