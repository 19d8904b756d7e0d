//! RedbStore: redb-backed rows and blobs.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use rackplane_substrate::tables::BATCH_DELETE_LIMIT;
use rackplane_substrate::{Item, ObjectStore, SubstrateError, SubstrateResult, Tables};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(ITEMS).map_err(map_err!(Table))?;
        txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Raw access ─────────────────────────────────────────────────

    fn read(&self, def: TableDefinition<&str, &[u8]>, key: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        Ok(table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    fn write(&self, def: TableDefinition<&str, &[u8]>, key: &str, value: &[u8]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Remove every key in `keys`. Returns how many existed.
    fn remove(&self, def: TableDefinition<&str, &[u8]>, keys: &[String]) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            for key in keys {
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, key-ordered.
    fn scan(&self, def: TableDefinition<&str, &[u8]>, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            out.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(out)
    }

    // ── Items ──────────────────────────────────────────────────────

    pub fn get_row(&self, table: &str, id: &str) -> StateResult<Option<Item>> {
        match self.read(ITEMS, &item_key(table, id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?)),
            None => Ok(None),
        }
    }

    pub fn put_row(&self, table: &str, id: &str, item: &Item) -> StateResult<()> {
        let value = serde_json::to_vec(item).map_err(map_err!(Serialize))?;
        self.write(ITEMS, &item_key(table, id), &value)?;
        debug!(%table, %id, "row stored");
        Ok(())
    }

    pub fn delete_rows(&self, table: &str, ids: &[String]) -> StateResult<usize> {
        let keys: Vec<String> = ids.iter().map(|id| item_key(table, id)).collect();
        let removed = self.remove(ITEMS, &keys)?;
        debug!(%table, requested = ids.len(), removed, "rows deleted");
        Ok(removed)
    }

    pub fn rows(&self, table: &str) -> StateResult<Vec<Item>> {
        self.scan(ITEMS, &item_key(table, ""))?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(map_err!(Deserialize)))
            .collect()
    }

    // ── Objects ────────────────────────────────────────────────────

    pub fn get_object(&self, bucket: &str, key: &str) -> StateResult<Option<Vec<u8>>> {
        self.read(OBJECTS, &object_key(bucket, key))
    }

    pub fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> StateResult<()> {
        self.write(OBJECTS, &object_key(bucket, key), data)?;
        debug!(%bucket, %key, bytes = data.len(), "object stored");
        Ok(())
    }

    pub fn delete_objects(&self, bucket: &str, keys: &[String]) -> StateResult<usize> {
        let full: Vec<String> = keys.iter().map(|k| object_key(bucket, k)).collect();
        self.remove(OBJECTS, &full)
    }

    /// Object keys (without the bucket) under `prefix`.
    pub fn object_keys(&self, bucket: &str, prefix: &str) -> StateResult<Vec<String>> {
        let bucket_prefix = object_key(bucket, "");
        Ok(self
            .scan(OBJECTS, &object_key(bucket, prefix))?
            .into_iter()
            .filter_map(|(k, _)| k.strip_prefix(&bucket_prefix).map(str::to_string))
            .collect())
    }
}

fn no_such_key(key: &str) -> SubstrateError {
    SubstrateError::api("NoSuchKey", format!("The specified key does not exist: {key}"))
}

#[async_trait]
impl Tables for RedbStore {
    async fn get_item(&self, table: &str, id: &str) -> SubstrateResult<Option<Item>> {
        Ok(self.get_row(table, id)?)
    }

    async fn put_item(&self, table: &str, item: Item) -> SubstrateResult<()> {
        let id = item
            .get("id")
            .cloned()
            .ok_or_else(|| SubstrateError::api("ValidationException", "item is missing the id attribute"))?;
        Ok(self.put_row(table, &id, &item)?)
    }

    async fn update_attribute(&self, table: &str, id: &str, name: &str, value: &str) -> SubstrateResult<()> {
        let mut item = self.get_row(table, id)?.unwrap_or_else(|| {
            let mut fresh = Item::new();
            fresh.insert("id".to_string(), id.to_string());
            fresh
        });
        item.insert(name.to_string(), value.to_string());
        Ok(self.put_row(table, id, &item)?)
    }

    async fn delete_item(&self, table: &str, id: &str) -> SubstrateResult<()> {
        self.delete_rows(table, &[id.to_string()])?;
        Ok(())
    }

    async fn query_app(
        &self,
        table: &str,
        app: &str,
        limit: Option<usize>,
        descending: bool,
    ) -> SubstrateResult<Vec<Item>> {
        let mut rows: Vec<Item> = self
            .rows(table)?
            .into_iter()
            .filter(|item| item.get("app").map(String::as_str) == Some(app))
            .collect();
        rows.sort_by(|a, b| a.get("created").cmp(&b.get("created")));
        if descending {
            rows.reverse();
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn batch_delete(&self, table: &str, ids: &[String]) -> SubstrateResult<()> {
        if ids.len() > BATCH_DELETE_LIMIT {
            return Err(SubstrateError::api(
                "ValidationException",
                format!("Too many items requested for the BatchWriteItem call: {}", ids.len()),
            ));
        }
        self.delete_rows(table, ids)?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for RedbStore {
    async fn get(&self, bucket: &str, key: &str) -> SubstrateResult<Vec<u8>> {
        self.get_object(bucket, key)?.ok_or_else(|| no_such_key(key))
    }

    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>, _public: bool) -> SubstrateResult<()> {
        Ok(self.put_object(bucket, key, &data)?)
    }

    async fn delete(&self, bucket: &str, key: &str) -> SubstrateResult<()> {
        self.delete_objects(bucket, &[key.to_string()])?;
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> SubstrateResult<bool> {
        Ok(self.get_object(bucket, key)?.is_some())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> SubstrateResult<Vec<String>> {
        Ok(self.object_keys(bucket, prefix)?)
    }

    async fn delete_bucket(&self, bucket: &str) -> SubstrateResult<()> {
        let keys = self.object_keys(bucket, "")?;
        let removed = self.delete_objects(bucket, &keys)?;
        debug!(%bucket, removed, "bucket emptied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> RedbStore {
        RedbStore::open_in_memory().unwrap()
    }

    fn row(id: &str, app: &str, created: &str) -> Item {
        [("id", id), ("app", app), ("created", created)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ── Items ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn put_get_delete_item() {
        let store = test_store();
        store.put_item("builds", row("B1", "web", "20200101.000000.000000000")).await.unwrap();

        let got = store.get_item("builds", "B1").await.unwrap().unwrap();
        assert_eq!(got["app"], "web");
        assert!(store.get_item("releases", "B1").await.unwrap().is_none());

        store.delete_item("builds", "B1").await.unwrap();
        assert!(store.get_item("builds", "B1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn item_without_id_is_rejected() {
        let store = test_store();
        let err = store.put_item("builds", Item::new()).await.unwrap_err();
        assert!(err.is_code("ValidationException"));
    }

    #[tokio::test]
    async fn query_app_orders_by_created() {
        let store = test_store();
        store.put_item("builds", row("B1", "web", "20200101.000000.000000000")).await.unwrap();
        store.put_item("builds", row("B3", "web", "20200103.000000.000000000")).await.unwrap();
        store.put_item("builds", row("B2", "web", "20200102.000000.000000000")).await.unwrap();
        store.put_item("builds", row("B9", "api", "20200109.000000.000000000")).await.unwrap();

        let newest = store.query_app("builds", "web", Some(2), true).await.unwrap();
        let ids: Vec<_> = newest.iter().map(|i| i["id"].as_str()).collect();
        assert_eq!(ids, vec!["B3", "B2"]);

        let oldest = store.query_app("builds", "web", None, false).await.unwrap();
        assert_eq!(oldest[0]["id"], "B1");
        assert_eq!(oldest.len(), 3);
    }

    #[tokio::test]
    async fn update_attribute_creates_or_merges() {
        let store = test_store();
        store.put_item("releases", row("R1", "web", "x")).await.unwrap();
        store.update_attribute("releases", "R1", "definitions", "{}").await.unwrap();

        let got = store.get_item("releases", "R1").await.unwrap().unwrap();
        assert_eq!(got["definitions"], "{}");
        assert_eq!(got["app"], "web");
    }

    #[tokio::test]
    async fn batch_delete_enforces_limit() {
        let store = test_store();
        let ids: Vec<String> = (0..26).map(|i| format!("B{i}")).collect();
        assert!(store.batch_delete("builds", &ids).await.is_err());
        store.batch_delete("builds", &ids[..25]).await.unwrap();
    }

    // ── Objects ────────────────────────────────────────────────────

    #[tokio::test]
    async fn objects_are_scoped_by_bucket() {
        let store = test_store();
        store.put("a", "releases/R1/env", b"X=1".to_vec(), false).await.unwrap();
        store.put("a", "releases/R2/env", b"X=2".to_vec(), false).await.unwrap();
        store.put("ab", "releases/R3/env", b"X=3".to_vec(), false).await.unwrap();

        assert_eq!(
            store.list("a", "releases/").await.unwrap(),
            vec!["releases/R1/env".to_string(), "releases/R2/env".to_string()]
        );
        assert!(store.exists("a", "releases/R1/env").await.unwrap());
        assert!(!store.exists("a", "releases/R3/env").await.unwrap());

        let err = store.get("a", "missing").await.unwrap_err();
        assert!(err.is_code("NoSuchKey"));
    }

    #[tokio::test]
    async fn delete_bucket_removes_everything() {
        let store = test_store();
        store.put("a", "k1", b"1".to_vec(), false).await.unwrap();
        store.put("a", "k2", b"2".to_vec(), false).await.unwrap();
        store.delete_bucket("a").await.unwrap();
        assert!(store.list("a", "").await.unwrap().is_empty());
    }

    // ── Persistence ────────────────────────────────────────────────

    #[tokio::test]
    async fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rack.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.put_item("builds", row("B1", "web", "x")).await.unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert!(store.get_item("builds", "B1").await.unwrap().is_some());
    }
}
