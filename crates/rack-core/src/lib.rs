//! rack-core: shared vocabulary for the rack control plane.
//!
//! Holds the immutable [`Config`] read from the environment, the entity
//! types returned by the provider, identifier and timestamp codecs, the
//! `KEY=VALUE` environment codec, and the error taxonomy every other crate
//! reports through.

pub mod config;
pub mod env;
pub mod error;
pub mod id;
pub mod index;
pub mod manifest;
pub mod time;
pub mod types;

pub use config::{Config, ConfigError, ProviderKind};
pub use env::Environment;
pub use error::ErrorKind;
pub use id::generate_id;
pub use index::{Index, IndexEntry, content_hash, index_dir};
pub use manifest::{ManifestService, ServiceIndex};
pub use types::*;
