//! Atlas archive reader and integrity verification
//!
//! Loads the manifest (rejecting unknown versions), decodes parts, and
//! re-derives every recorded hash so an archive can be trusted without
//! re-crawling.

use log::debug;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use zstd::stream::read::Decoder;

use super::manifest::{ATLAS_VERSION, AtlasManifest, compute_audit_hash};
use super::writer::{AtlasError, AtlasWriter};

/// Read-only view over a closed Atlas archive
pub struct AtlasReader {
    dir: PathBuf,
    manifest: AtlasManifest,
}

impl AtlasReader {
    /// Open an archive directory. Fails when the manifest is missing or
    /// its version is not understood.
    pub fn open(dir: &Path) -> Result<Self, AtlasError> {
        let manifest_path = AtlasWriter::manifest_path(dir);
        if !manifest_path.exists() {
            return Err(AtlasError::MissingManifest);
        }
        let manifest: AtlasManifest =
            serde_json::from_reader(File::open(&manifest_path)?)?;
        if manifest.atlas_version != ATLAS_VERSION {
            return Err(AtlasError::VersionMismatch {
                found: manifest.atlas_version,
                supported: ATLAS_VERSION,
            });
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
        })
    }

    #[must_use]
    pub fn manifest(&self) -> &AtlasManifest {
        &self.manifest
    }

    /// Decompress a whole part
    pub fn read_part_bytes(&self, name: &str) -> Result<Vec<u8>, AtlasError> {
        let path = AtlasWriter::part_path(&self.dir, name);
        if !path.exists() {
            return Err(AtlasError::UnknownPart(name.to_string()));
        }
        let mut decoder = Decoder::new(File::open(path)?)?;
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Decode a part into one JSON value per row
    pub fn read_part_records(&self, name: &str) -> Result<Vec<serde_json::Value>, AtlasError> {
        let bytes = self.read_part_bytes(name)?;
        let text = String::from_utf8_lossy(&bytes);
        text.lines()
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).map_err(AtlasError::from))
            .collect()
    }

    /// Verify every part against the manifest and the audit hash
    ///
    /// Checks, per part: newline-terminated row count, uncompressed byte
    /// count, and content hash; then recomputes the audit hash from the
    /// per-part hashes.
    pub fn verify(&self) -> Result<(), AtlasError> {
        for part in &self.manifest.parts {
            let bytes = self.read_part_bytes(&part.name)?;
            let rows = bytes.iter().filter(|b| **b == b'\n').count() as u64;
            if rows != part.row_count {
                return Err(AtlasError::IntegrityFailure {
                    part: part.name.clone(),
                    detail: format!("manifest says {} rows, part holds {rows}", part.row_count),
                });
            }
            if bytes.len() as u64 != part.uncompressed_bytes {
                return Err(AtlasError::IntegrityFailure {
                    part: part.name.clone(),
                    detail: format!(
                        "manifest says {} uncompressed bytes, part holds {}",
                        part.uncompressed_bytes,
                        bytes.len()
                    ),
                });
            }
            let hash = hex::encode(Sha256::digest(&bytes));
            if hash != part.content_hash {
                return Err(AtlasError::IntegrityFailure {
                    part: part.name.clone(),
                    detail: "content hash mismatch".to_string(),
                });
            }
            debug!("Part '{}' verified ({rows} rows)", part.name);
        }

        let audit = compute_audit_hash(&self.manifest.parts);
        if audit != self.manifest.audit_hash {
            return Err(AtlasError::IntegrityFailure {
                part: "<manifest>".to_string(),
                detail: "audit hash mismatch".to_string(),
            });
        }
        Ok(())
    }
}
