//! Local artifact cache entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Local replica of a remote artifact.
///
/// Valid only while `version_tag` matches the remote object's current
/// fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub remote_key: String,
    /// Remote content fingerprint at fetch time
    pub version_tag: String,
    pub local_path: PathBuf,
    /// SHA-256 of the local bytes, hex encoded
    pub sha256: String,
    pub size_bytes: u64,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_current(&self, remote_version_tag: &str) -> bool {
        self.version_tag == remote_version_tag
    }
}
