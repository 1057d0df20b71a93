//! SDK version registry.
//!
//! Maps an SDK version identifier to the factory that builds clients for
//! it. The registry is an ordinary value: build it once and hand it to the
//! worker manager.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::client::{ClientError, ClientOptions, Identity, ProtocolClient};
use crate::link::NetworkLink;

/// Builds protocol clients for one SDK version.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Create (or reopen) the client for `identity` at `options.db_path`.
    ///
    /// Every network call the client makes goes through `link`.
    async fn create(
        &self,
        identity: &Identity,
        options: &ClientOptions,
        link: NetworkLink,
    ) -> Result<Arc<dyn ProtocolClient>, ClientError>;

    /// Discard the local database at `db_path`.
    async fn drop_database(&self, db_path: &Path) -> Result<(), ClientError>;
}

/// One registered binding.
#[derive(Clone)]
pub struct RegisteredVersion {
    /// SDK version, e.g. `4.5.0`
    pub sdk_version: String,
    /// Native library version bundled with it
    pub lib_version: String,
    /// Factory for clients of this version
    pub factory: Arc<dyn ClientFactory>,
}

impl fmt::Debug for RegisteredVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredVersion")
            .field("sdk_version", &self.sdk_version)
            .field("lib_version", &self.lib_version)
            .finish_non_exhaustive()
    }
}

/// Ordered version → factory table. The last registered version is latest.
#[derive(Debug, Clone, Default)]
pub struct VersionRegistry {
    entries: Vec<RegisteredVersion>,
}

impl VersionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding. Re-registering a version replaces it in place.
    pub fn register(
        mut self,
        sdk_version: impl Into<String>,
        lib_version: impl Into<String>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let entry = RegisteredVersion {
            sdk_version: sdk_version.into(),
            lib_version: lib_version.into(),
            factory,
        };
        match self
            .entries
            .iter_mut()
            .find(|e| e.sdk_version == entry.sdk_version)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self
    }

    /// Look up an exact version.
    pub fn get(&self, sdk_version: &str) -> Result<&RegisteredVersion, ClientError> {
        self.entries
            .iter()
            .find(|e| e.sdk_version == sdk_version)
            .ok_or_else(|| ClientError::UnknownSdkVersion(sdk_version.to_string()))
    }

    /// The most recently registered version.
    pub fn latest(&self) -> Option<&RegisteredVersion> {
        self.entries.last()
    }

    /// Resolve a requested version, falling back to latest when none is given.
    pub fn resolve(&self, requested: Option<&str>) -> Result<&RegisteredVersion, ClientError> {
        match requested {
            Some(version) => self.get(version),
            None => self
                .latest()
                .ok_or_else(|| ClientError::UnknownSdkVersion("<none registered>".into())),
        }
    }

    /// Registered version identifiers, oldest first.
    pub fn versions(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.sdk_version.as_str()).collect()
    }

    /// Number of registered versions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
