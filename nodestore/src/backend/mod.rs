//! Pluggable physical key-to-blob stores.
//!
//! The core treats a backend as a trust boundary: fetches report a
//! four-valued status so corruption is distinguishable from absence, and is
//! logged but never silently healed.

mod flatfile;
mod memory;

pub use flatfile::FlatFileBackend;
pub use memory::MemoryBackend;

use crate::object::NodeObject;
use alloy_primitives::B256;
use eyre::{eyre, Result};
use std::path::Path;
use std::sync::Arc;

/// Outcome of a backend fetch. Distinct from I/O errors, which backends
/// surface through `Result`.
#[derive(Debug, Clone)]
pub enum Fetched {
    Found(Arc<NodeObject>),
    NotFound,
    /// The key was present but its payload failed verification.
    Corrupt,
}

/// Contract for a physical key-to-blob store underlying a shard or
/// rotating tier.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Durably persist one object.
    fn store(&self, object: &Arc<NodeObject>) -> Result<()>;

    fn store_batch(&self, batch: &[Arc<NodeObject>]) -> Result<()> {
        for object in batch {
            self.store(object)?;
        }
        Ok(())
    }

    fn fetch(&self, hash: &B256) -> Result<Fetched>;

    /// Visit every stored object, in no particular order.
    fn for_each(&self, f: &mut dyn FnMut(Arc<NodeObject>)) -> Result<()>;

    /// Advertised file-descriptor requirement. Zero marks an in-memory or
    /// null backend, and callers take a simplified code path.
    fn fd_limit(&self) -> u32;

    /// Monotone write counter used to aggregate write pressure.
    fn write_load(&self) -> u64;
}

/// Resolve a backend factory by its configured type name.
pub fn make_backend(kind: &str, path: &Path) -> Result<Box<dyn Backend>> {
    match kind {
        "memory" => Ok(Box::new(MemoryBackend::new())),
        "flatfile" => Ok(Box::new(FlatFileBackend::open(path)?)),
        other => Err(eyre!("unknown backend type {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unknown_types() {
        let err = match make_backend("paper-tape", Path::new("/nonexistent")) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("unknown backend type"));
    }
}
