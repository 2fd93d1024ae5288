//! Last-applied policy specs
//!
//! The [`SnapshotStore`] remembers, per policy key, the spec that was last
//! compiled and successfully applied, including the sets each FQDN selector
//! resolved to at that time. The change detector compares against it; the
//! scheduler overwrites entries only after an apply succeeded.
//!
//! Entries are never removed when a policy disappears from the cluster. The
//! selectors of a deleted policy therefore keep taking part in resolution
//! drift: if one of them resolves to different sets, every following check
//! reports drift and the ruleset is rebuilt, since nothing re-records that
//! entry.
//!
//! # Persistence
//!
//! The store can be written to and rehydrated from a JSON file so a restart
//! does not force a reload of an unchanged ruleset. The file carries a format
//! version and a SHA-256 checksum of its entries; a file that fails either
//! check is rejected and the caller starts from an empty store.

use crate::core::error::{Result, SnapshotError};
use crate::core::policy::{PolicyKey, PolicySpec};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Current on-disk format version
const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStore {
    specs: BTreeMap<PolicyKey, PolicySpec>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    checksum: String,
    specs: BTreeMap<String, PolicySpec>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PolicyKey) -> Option<&PolicySpec> {
        self.specs.get(key)
    }

    /// Records `spec` as the last applied spec for `key`
    pub fn record(&mut self, key: PolicyKey, spec: PolicySpec) {
        self.specs.insert(key, spec);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PolicyKey, &PolicySpec)> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    fn checksum(specs: &BTreeMap<String, PolicySpec>) -> Result<String> {
        let json = serde_json::to_string(specs)?;
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn to_file(&self) -> Result<StoreFile> {
        let specs: BTreeMap<String, PolicySpec> = self
            .specs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Ok(StoreFile {
            version: STORE_VERSION,
            checksum: Self::checksum(&specs)?,
            specs,
        })
    }

    fn from_file(file: StoreFile) -> Result<Self> {
        if file.version != STORE_VERSION {
            return Err(SnapshotError::VersionMismatch {
                found: file.version,
                expected: STORE_VERSION,
            }
            .into());
        }
        let actual = Self::checksum(&file.specs)?;
        if actual != file.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: file.checksum,
                actual,
            }
            .into());
        }

        let mut store = Self::new();
        for (key, spec) in file.specs {
            let key = key
                .parse::<PolicyKey>()
                .map_err(|_| SnapshotError::InvalidKey(key.clone()))?;
            store.record(key, spec);
        }
        Ok(store)
    }

    /// Writes the store to `path` atomically with mode 0600
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.to_file()?)?;
        crate::utils::write_atomic(path, json.into_bytes()).await?;
        info!("Saved {} policy snapshot(s) to {}", self.len(), path.display());
        Ok(())
    }

    /// Loads a store previously written by [`SnapshotStore::save`].
    ///
    /// A missing file yields an empty store.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let store = Self::from_file(serde_json::from_str(&json)?)?;
        info!("Rehydrated {} policy snapshot(s) from {}", store.len(), path.display());
        Ok(store)
    }

    /// Like [`SnapshotStore::load`], but starts empty on any error
    pub async fn load_or_empty(path: &Path) -> Self {
        match Self::load(path).await {
            Ok(store) => store,
            Err(e) => {
                warn!("Ignoring snapshot store {}: {e}", path.display());
                Self::new()
            }
        }
    }
}
