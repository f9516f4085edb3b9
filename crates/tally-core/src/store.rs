//! Local Record Store - per-table collections with change notifications
//!
//! The only thing the rest of the app reads and writes directly. Mutations
//! apply synchronously and never fail; every successful apply publishes a
//! change notification scoped to the table plus a catch-all notification,
//! which is the only side effect visible outside the core.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::broadcast;

use crate::protocol::MutationKind;
use crate::record::Record;
use crate::registry::{Registry, TableDef};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Notification emitted after every store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub table: String,
}

/// In-memory collections for every registry table.
pub struct LocalStore {
    registry: Registry,
    tables: BTreeMap<String, Vec<Record>>,
    all_tx: broadcast::Sender<StoreEvent>,
    table_tx: HashMap<String, broadcast::Sender<StoreEvent>>,
}

impl LocalStore {
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        let tables = registry
            .tables()
            .map(|t| (t.name.to_string(), Vec::new()))
            .collect();
        let (all_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            registry,
            tables,
            all_tx,
            table_tx: HashMap::new(),
        }
    }

    /// Restore a store from snapshotted collections. Tables unknown to the
    /// registry are dropped.
    #[must_use]
    pub fn from_collections(registry: Registry, collections: BTreeMap<String, Vec<Record>>) -> Self {
        let mut store = Self::new(registry);
        for (table, records) in collections {
            if store.tables.contains_key(&table) {
                store.tables.insert(table, records);
            }
        }
        store
    }

    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Apply a mutation to `table`'s collection and return the resulting
    /// record. Insert appends, update replaces by primary key, delete
    /// removes by primary key. This is a pure local-state transition.
    pub fn apply(&mut self, table: &TableDef, kind: MutationKind, record: Record) -> Record {
        let key = record.primary_key_of(table);
        let collection = self.tables.entry(table.name.to_string()).or_default();

        match kind {
            MutationKind::Insert => collection.push(record.clone()),
            MutationKind::Update => {
                let slot = key.as_deref().and_then(|k| {
                    collection
                        .iter_mut()
                        .find(|r| r.primary_key_of(table).as_deref() == Some(k))
                });
                match slot {
                    Some(existing) => *existing = record.clone(),
                    None => collection.push(record.clone()),
                }
            }
            MutationKind::Delete => {
                if let Some(k) = key.as_deref() {
                    collection.retain(|r| r.primary_key_of(table).as_deref() != Some(k));
                }
            }
        }

        self.notify(table.name);
        record
    }

    /// Replace a record's primary key in place, leaving all other fields
    /// untouched. Returns false when no record carries `old_key`.
    pub fn rewrite_primary_key(&mut self, table: &TableDef, old_key: &str, new_key: &str) -> bool {
        let Some(collection) = self.tables.get_mut(table.name) else {
            return false;
        };
        let Some(record) = collection
            .iter_mut()
            .find(|r| r.primary_key_of(table).as_deref() == Some(old_key))
        else {
            return false;
        };
        record.set_primary_key(table, new_key);
        self.notify(table.name);
        true
    }

    /// Overwrite every collection wholesale (hydration). Collections absent
    /// from `collections` are cleared.
    pub fn replace_all(&mut self, collections: BTreeMap<String, Vec<Record>>) {
        let names: Vec<String> = self.tables.keys().cloned().collect();
        for name in names {
            let records = collections.get(&name).cloned().unwrap_or_default();
            self.tables.insert(name.clone(), records);
            self.notify(&name);
        }
    }

    #[must_use]
    pub fn records(&self, table: &str) -> &[Record] {
        self.tables.get(table).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn find(&self, table: &TableDef, key: &str) -> Option<&Record> {
        self.records(table.name)
            .iter()
            .find(|r| r.primary_key_of(table).as_deref() == Some(key))
    }

    /// Current collections, for snapshot persistence.
    #[must_use]
    pub fn collections(&self) -> BTreeMap<String, Vec<Record>> {
        self.tables.clone()
    }

    /// Subscribe to change notifications for one table.
    pub fn subscribe(&mut self, table: &str) -> broadcast::Receiver<StoreEvent> {
        self.table_tx
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to the catch-all change channel.
    #[must_use]
    pub fn subscribe_all(&self) -> broadcast::Receiver<StoreEvent> {
        self.all_tx.subscribe()
    }

    fn notify(&self, table: &str) {
        let event = StoreEvent {
            table: table.to_string(),
        };
        if let Some(tx) = self.table_tx.get(table) {
            let _ = tx.send(event.clone());
        }
        let _ = self.all_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn store() -> LocalStore {
        LocalStore::new(Registry::retail())
    }

    fn products() -> &'static TableDef {
        Registry::retail().get("products").unwrap()
    }

    fn record(value: serde_json::Value) -> Record {
        Record::from_json(value).unwrap()
    }

    #[test]
    fn insert_update_delete_by_primary_key() {
        let mut store = store();
        let table = products();

        store.apply(
            table,
            MutationKind::Insert,
            record(json!({ "id": "p1", "name": "Espresso", "price": 2.5 })),
        );
        store.apply(
            table,
            MutationKind::Insert,
            record(json!({ "id": "p2", "name": "Latte", "price": 3.5 })),
        );
        assert_eq!(store.records("products").len(), 2);

        store.apply(
            table,
            MutationKind::Update,
            record(json!({ "id": "p1", "name": "Doppio", "price": 2.8 })),
        );
        let updated = store.find(table, "p1").unwrap();
        assert_eq!(updated.get("name"), Some(&json!("Doppio")));
        assert_eq!(store.records("products").len(), 2);

        store.apply(table, MutationKind::Delete, record(json!({ "id": "p2" })));
        assert_eq!(store.records("products").len(), 1);
        assert!(store.find(table, "p2").is_none());
    }

    #[test]
    fn apply_notifies_table_and_catch_all_subscribers() {
        let mut store = store();
        let mut table_rx = store.subscribe("products");
        let mut all_rx = store.subscribe_all();

        store.apply(
            products(),
            MutationKind::Insert,
            record(json!({ "id": "p1" })),
        );

        assert_eq!(table_rx.try_recv().unwrap().table, "products");
        assert_eq!(all_rx.try_recv().unwrap().table, "products");
    }

    #[test]
    fn rewrite_primary_key_keeps_other_fields() {
        let mut store = store();
        let table = products();
        store.apply(
            table,
            MutationKind::Insert,
            record(json!({ "id": "p1", "name": "Espresso", "price": 2.5 })),
        );

        assert!(store.rewrite_primary_key(table, "p1", "p9"));
        assert!(store.find(table, "p1").is_none());
        let renamed = store.find(table, "p9").unwrap();
        assert_eq!(renamed.get("name"), Some(&json!("Espresso")));
        assert_eq!(renamed.get("price"), Some(&json!(2.5)));

        assert!(!store.rewrite_primary_key(table, "missing", "x"));
    }

    #[test]
    fn replace_all_overwrites_wholesale() {
        let mut store = store();
        store.apply(
            products(),
            MutationKind::Insert,
            record(json!({ "id": "stale" })),
        );

        let mut incoming = BTreeMap::new();
        incoming.insert(
            "products".to_string(),
            vec![record(json!({ "id": "p1" })), record(json!({ "id": "p2" }))],
        );
        store.replace_all(incoming);

        assert_eq!(store.records("products").len(), 2);
        assert!(store.find(products(), "stale").is_none());
        // Tables absent from the payload are cleared, not merged.
        assert!(store.records("orders").is_empty());
    }
}
