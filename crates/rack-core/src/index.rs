//! Content-addressed file index used by build ingest.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Path relative to the index root.
    pub name: String,
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
}

/// SHA-256 hex of file contents → entry.
pub type Index = BTreeMap<String, IndexEntry>;

pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Build an index over every regular file below `root`.
pub fn index_dir(root: &Path) -> io::Result<Index> {
    let mut index = Index::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let data = std::fs::read(entry.path())?;
        let meta = entry.metadata().map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .replace('\\', "/");
        let mod_time = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        index.insert(
            content_hash(&data),
            IndexEntry {
                name: rel,
                mode: file_mode(&meta),
                mod_time,
            },
        );
    }
    Ok(index)
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}
