//! rackplane-provider: every rack operation, over a substrate.
//!
//! ```text
//!   caller ──▶ Provider ──▶ cache ──▶ Substrate (stacks, scheduler, tables, …)
//!                 │
//!                 ├── stack helpers (describe, update_stack funnel)
//!                 ├── envelope crypto
//!                 └── event bus (one event per mutation)
//! ```
//!
//! [`Provider`] holds the configuration, the substrate clients and the call
//! cache. Operations are grouped into per-entity traits in [`ops`]; the
//! provider implements all of them.

pub mod cache;
pub mod context;
pub mod crypto;
pub mod error;
pub mod ops;
pub mod provider;
pub mod render;
pub mod stack;

mod apps;
mod builds;
mod capacity;
mod certs;
mod events;
mod index;
mod instances;
mod keys;
mod logs;
mod objects;
mod processes;
mod registries;
mod releases;
mod resources;
mod settings;
mod system;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use builds::{BUILD_TIMEOUT, registry_tag};
pub use cache::Cache;
pub use context::CallContext;
pub use error::{ProviderError, ProviderResult};
pub use index::INDEX_CONCURRENCY;
pub use logs::log_line;
pub use ops::*;
pub use provider::Provider;
pub use render::{AppTemplate, JsonRenderer, ResourceTemplate, TemplateRenderer};
pub use stack::human_status;
pub use system::INSTANCE_TYPES;
