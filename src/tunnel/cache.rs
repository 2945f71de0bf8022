//! Persisted tunnel catalog cache.
//!
//! Read at startup so a restart can reconnect without a broker round-trip;
//! written back after a confirmed-working reselection. The serialized form
//! only needs a lossless round-trip.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::tunnel::TunnelCatalog;

/// Storage boundary for the catalog cache.
pub trait CatalogStore: Send + Sync {
    /// Load the cached catalog, `None` when no cache exists.
    fn load(&self) -> Result<Option<TunnelCatalog>>;

    /// Persist the catalog.
    fn store(&self, catalog: &TunnelCatalog) -> Result<()>;
}

/// JSON-file backed store.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CatalogStore for JsonFileStore {
    fn load(&self) -> Result<Option<TunnelCatalog>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&data) {
            Ok(catalog) => Ok(Some(catalog)),
            Err(e) => {
                // A corrupt cache is recoverable: re-query the broker.
                warn!(path = %self.path.display(), error = %e, "discarding unreadable tunnel cache");
                Ok(None)
            }
        }
    }

    fn store(&self, catalog: &TunnelCatalog) -> Result<()> {
        let data = serde_json::to_string_pretty(catalog)
            .map_err(|e| Error::Unexpected(format!("cache serialization failed: {e}")))?;
        // Write-then-rename so readers never observe a partial file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "tunnel cache written");
        Ok(())
    }
}

/// In-memory store for tests and embedders without persistence.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Option<TunnelCatalog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preloaded(catalog: TunnelCatalog) -> Self {
        Self {
            inner: Mutex::new(Some(catalog)),
        }
    }
}

impl CatalogStore for MemoryStore {
    fn load(&self) -> Result<Option<TunnelCatalog>> {
        Ok(self.inner.lock().unwrap().clone())
    }

    fn store(&self, catalog: &TunnelCatalog) -> Result<()> {
        *self.inner.lock().unwrap() = Some(catalog.clone());
        Ok(())
    }
}
