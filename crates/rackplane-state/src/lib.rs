//! rackplane-state: durable records for the local binding.
//!
//! Backed by [redb](https://docs.rs/redb). Table rows and object bodies
//! live in two redb tables under composite keys, `{table}/{id}` and
//! `{bucket}/{key}`, so a prefix range scan answers both the per-app row
//! queries and object listings.
//!
//! [`RedbStore`] is `Clone + Send + Sync` (backed by `Arc<Database>`) and
//! implements the substrate [`Tables`](rackplane_substrate::Tables) and
//! [`ObjectStore`](rackplane_substrate::ObjectStore) capabilities.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::RedbStore;
