//! redb table definitions.

use redb::TableDefinition;

/// Table rows keyed by `{table}/{id}`, JSON-encoded attribute maps.
pub const ITEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("items");

/// Object bodies keyed by `{bucket}/{key}`.
pub const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

pub fn item_key(table: &str, id: &str) -> String {
    format!("{table}/{id}")
}

pub fn object_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}
