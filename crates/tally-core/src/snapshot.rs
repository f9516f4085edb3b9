//! On-device durability for the record store and sync queue
//!
//! One JSON snapshot file holds every collection plus the pending queue;
//! it is rewritten after each local mutation and queue transition, and
//! loaded at startup.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::queue::{SyncQueue, SyncTask};
use crate::record::Record;
use crate::store::LocalStore;

/// Serialized device state.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: BTreeMap<String, Vec<Record>>,
    pub queue: Vec<SyncTask>,
}

/// Load a snapshot, returning `None` when no file exists yet.
pub fn load(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let snapshot = serde_json::from_slice(&bytes)?;
    Ok(Some(snapshot))
}

/// Persist the store and queue. Writes to a sibling temp file first so a
/// crash mid-write cannot truncate the previous snapshot.
pub fn save(path: &Path, store: &LocalStore, queue: &SyncQueue) -> Result<()> {
    let snapshot = Snapshot {
        records: store.collections(),
        queue: queue.tasks(),
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::protocol::MutationKind;
    use crate::registry::Registry;

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.json");

        let registry = Registry::retail();
        let mut store = LocalStore::new(registry);
        let products = registry.get("products").unwrap();
        let record = Record::from_json(json!({ "id": "p1", "name": "Espresso" })).unwrap();
        store.apply(products, MutationKind::Insert, record.clone());

        let mut queue = SyncQueue::new();
        queue.enqueue(SyncTask::new(MutationKind::Insert, "products", record));

        save(&path, &store, &queue).unwrap();
        let snapshot = load(&path).unwrap().unwrap();

        assert_eq!(snapshot.records.get("products").unwrap().len(), 1);
        assert_eq!(snapshot.queue.len(), 1);
        assert_eq!(snapshot.queue[0].table, "products");
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join("absent.json")).unwrap().is_none());
    }
}
