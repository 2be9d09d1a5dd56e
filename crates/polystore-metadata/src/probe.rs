//! Boundary of the data a storage engine already holds.

use polystore_common::{ColumnsRange, KeyInterval, Result};
use polystore_meta_store::StorageEngineMeta;

/// Resolves the columns range and key interval of an engine's
/// pre-existing data
///
/// Engine adapters that can inspect their backend implement this; the
/// manager calls it once, when the engine is registered.
pub trait BoundaryProbe: Send + Sync {
    fn boundary(&self, engine: &StorageEngineMeta) -> Result<(ColumnsRange, KeyInterval)>;
}

/// Derives the boundary from the engine's configured data prefix
#[derive(Clone, Copy, Debug, Default)]
pub struct PrefixBoundary;

impl BoundaryProbe for PrefixBoundary {
    fn boundary(&self, engine: &StorageEngineMeta) -> Result<(ColumnsRange, KeyInterval)> {
        let columns = match engine.data_prefix.as_deref() {
            Some(prefix) => ColumnsRange::prefix(prefix)?,
            None => ColumnsRange::unbounded(),
        };
        Ok((columns, KeyInterval::full()))
    }
}
