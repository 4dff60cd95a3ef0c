//! Atlas manifest: the archive's self-description and integrity root
//!
//! The manifest binds every part's content hash into a single audit hash.
//! An archive without a manifest is incomplete by definition; readers
//! must reject manifests whose version they do not understand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current archive format version
pub const ATLAS_VERSION: u32 = 1;

/// Per-part descriptor recorded at close time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartDescriptor {
    pub name: String,
    pub row_count: u64,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
    /// Hex SHA-256 of the decompressed part stream
    pub content_hash: String,
}

/// `manifest.json` contents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtlasManifest {
    pub atlas_version: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config_fingerprint: String,
    pub parts: Vec<PartDescriptor>,
    /// Hash over per-part hashes in lexicographic part-name order
    pub audit_hash: String,
}

/// Compute the audit hash over part descriptors
///
/// The per-part hex hashes are concatenated in lexicographic order of
/// part names and hashed once, so the audit hash uniquely determines the
/// bytewise content of every part.
#[must_use]
pub fn compute_audit_hash(parts: &[PartDescriptor]) -> String {
    let mut sorted: Vec<&PartDescriptor> = parts.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let mut hasher = Sha256::new();
    for part in sorted {
        hasher.update(part.content_hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, hash: &str) -> PartDescriptor {
        PartDescriptor {
            name: name.to_string(),
            row_count: 0,
            uncompressed_bytes: 0,
            compressed_bytes: 0,
            content_hash: hash.to_string(),
        }
    }

    #[test]
    fn audit_hash_is_order_independent() {
        let a = vec![descriptor("pages", "aa"), descriptor("edges", "bb")];
        let b = vec![descriptor("edges", "bb"), descriptor("pages", "aa")];
        assert_eq!(compute_audit_hash(&a), compute_audit_hash(&b));
    }

    #[test]
    fn audit_hash_binds_content() {
        let a = vec![descriptor("pages", "aa")];
        let b = vec![descriptor("pages", "ab")];
        assert_ne!(compute_audit_hash(&a), compute_audit_hash(&b));
    }
}
