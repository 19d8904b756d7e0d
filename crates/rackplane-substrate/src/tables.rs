//! Key-value tables with an `app.created` secondary index.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::SubstrateResult;

/// A table row: string attributes, keyed by the `id` attribute.
pub type Item = BTreeMap<String, String>;

/// Maximum number of ids accepted by one [`Tables::batch_delete`] call.
pub const BATCH_DELETE_LIMIT: usize = 25;

#[async_trait]
pub trait Tables: Send + Sync {
    async fn get_item(&self, table: &str, id: &str) -> SubstrateResult<Option<Item>>;

    /// Insert or replace. The item must carry an `id` attribute.
    async fn put_item(&self, table: &str, item: Item) -> SubstrateResult<()>;

    /// Set one attribute on an existing row.
    async fn update_attribute(&self, table: &str, id: &str, name: &str, value: &str) -> SubstrateResult<()>;

    async fn delete_item(&self, table: &str, id: &str) -> SubstrateResult<()>;

    /// Rows whose `app` attribute equals `app`, ordered by `created`.
    async fn query_app(
        &self,
        table: &str,
        app: &str,
        limit: Option<usize>,
        descending: bool,
    ) -> SubstrateResult<Vec<Item>>;

    /// Delete up to [`BATCH_DELETE_LIMIT`] rows.
    async fn batch_delete(&self, table: &str, ids: &[String]) -> SubstrateResult<()>;
}

pub fn item_id(item: &Item) -> Option<&str> {
    item.get("id").map(String::as_str)
}
