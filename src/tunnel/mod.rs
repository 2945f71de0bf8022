//! Tunnel specifications, catalog, and persisted cache.

mod cache;
mod catalog;
mod spec;

pub use cache::{CatalogStore, JsonFileStore, MemoryStore};
pub use catalog::{Replacement, TunnelCatalog};
pub use spec::{TunnelKind, TunnelSpec, TunnelSpecBuilder, MAX_MTU, MIN_MTU};
