//! Hydration - bootstrap a device's store from the remote authority
//!
//! Used when local credential lookup fails (new device, or wiped data) but
//! remote authentication succeeds. The pull is all-or-nothing: every table
//! is fetched and decoded before anything local is overwritten, so a
//! partial fetch leaves the store exactly as it was.

use crate::error::Result;
use crate::remote::RemoteAuthority;
use crate::store::LocalStore;

/// Fetch every registry table and overwrite the local collections
/// wholesale (not merged).
pub async fn pull_all<R: RemoteAuthority>(store: &mut LocalStore, remote: &R) -> Result<()> {
    let collections = remote.fetch_all().await?;
    let tables = collections.len();
    let rows: usize = collections.values().map(Vec::len).sum();
    store.replace_all(collections);
    tracing::info!(tables, rows, "hydrated local store from remote authority");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::result::Result;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::protocol::MutationKind;
    use crate::queue::SyncTask;
    use crate::record::Record;
    use crate::registry::Registry;
    use crate::remote::{LoginOutcome, PushOutcome, RemoteError};

    struct FakeRemote {
        tables: Option<BTreeMap<String, Vec<Record>>>,
    }

    impl RemoteAuthority for FakeRemote {
        async fn push(&self, _task: &SyncTask) -> Result<PushOutcome, RemoteError> {
            Ok(PushOutcome::Applied)
        }

        async fn fetch_all(&self) -> Result<BTreeMap<String, Vec<Record>>, RemoteError> {
            self.tables
                .clone()
                .ok_or_else(|| RemoteError::Envelope("truncated response".to_string()))
        }

        async fn login(
            &self,
            _username: &str,
            _password: &str,
            _device_id: &str,
        ) -> Result<LoginOutcome, RemoteError> {
            Ok(LoginOutcome::Rejected("not scripted".to_string()))
        }

        async fn heartbeat(&self, _user_id: &str, _device_id: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn logout(&self, _user_id: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn init_schema(&self) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn record(value: serde_json::Value) -> Record {
        Record::from_json(value).unwrap()
    }

    #[tokio::test]
    async fn pull_all_overwrites_collections_wholesale() {
        let registry = Registry::retail();
        let mut store = LocalStore::new(registry);
        let products = registry.get("products").unwrap();
        store.apply(products, MutationKind::Insert, record(json!({ "id": "stale" })));

        let mut tables = BTreeMap::new();
        tables.insert(
            "products".to_string(),
            vec![record(json!({ "id": "p1" })), record(json!({ "id": "p2" }))],
        );
        tables.insert("categories".to_string(), Vec::new());
        tables.insert(
            "orders".to_string(),
            vec![
                record(json!({ "id": "o1" })),
                record(json!({ "id": "o2" })),
                record(json!({ "id": "o3" })),
                record(json!({ "id": "o4" })),
                record(json!({ "id": "o5" })),
            ],
        );
        let remote = FakeRemote {
            tables: Some(tables),
        };

        pull_all(&mut store, &remote).await.unwrap();

        assert_eq!(store.records("products").len(), 2);
        assert_eq!(store.records("categories").len(), 0);
        assert_eq!(store.records("orders").len(), 5);
        assert!(store.find(products, "stale").is_none());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_store_untouched() {
        let registry = Registry::retail();
        let mut store = LocalStore::new(registry);
        let products = registry.get("products").unwrap();
        store.apply(products, MutationKind::Insert, record(json!({ "id": "keep" })));

        let remote = FakeRemote { tables: None };
        assert!(pull_all(&mut store, &remote).await.is_err());

        assert_eq!(store.records("products").len(), 1);
        assert!(store.find(products, "keep").is_some());
    }
}
