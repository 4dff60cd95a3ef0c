//! Streaming Atlas part writer
//!
//! One zstd-compressed JSONL file per part. Appends preserve acceptance
//! order; the writer is the only disk writer in the process. Checkpoint
//! flushes finish the current zstd frame and fsync, so the bytes up to
//! the recorded offset always form a valid decompressible prefix — that
//! is what makes resume-by-truncation safe.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::time::timeout;
use zstd::stream::read::Decoder;
use zstd::stream::write::Encoder;

use super::manifest::{ATLAS_VERSION, AtlasManifest, PartDescriptor, compute_audit_hash};

/// zstd compression level for part files
const COMPRESSION_LEVEL: i32 = 3;

/// Timeout for blocking flush/close operations
/// Frame finalization and fsync run on the blocking thread pool
const BLOCKING_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Built-in parts present in every archive
pub const BUILTIN_PARTS: &[&str] = &["pages", "edges", "assets", "errors"];

/// Writer failures. All of these are fatal to the crawl.
#[derive(Debug, Error)]
pub enum AtlasError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown part '{0}'")]
    UnknownPart(String),
    #[error("archive version {found} is not understood (supported: {supported})")]
    VersionMismatch { found: u32, supported: u32 },
    #[error("archive has no manifest (incomplete crawl)")]
    MissingManifest,
    #[error("integrity check failed for part '{part}': {detail}")]
    IntegrityFailure { part: String, detail: String },
    #[error("resume offset state does not match part '{part}': {detail}")]
    OffsetMismatch { part: String, detail: String },
}

/// Durable position of one part at a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartOffsets {
    pub compressed_bytes: u64,
    pub rows: u64,
    pub uncompressed_bytes: u64,
}

struct PartWriter {
    path: PathBuf,
    encoder: Option<Encoder<'static, File>>,
    rows: u64,
    uncompressed_bytes: u64,
    hasher: Sha256,
    /// Bytes on disk as of the last finished frame
    flushed_compressed_bytes: u64,
    /// Rows appended since the last finished frame
    rows_in_frame: u64,
}

impl PartWriter {
    fn create(path: PathBuf) -> Result<Self, AtlasError> {
        let file = File::create(&path)?;
        let encoder = Encoder::new(file, COMPRESSION_LEVEL)?;
        Ok(Self {
            path,
            encoder: Some(encoder),
            rows: 0,
            uncompressed_bytes: 0,
            hasher: Sha256::new(),
            flushed_compressed_bytes: 0,
            rows_in_frame: 0,
        })
    }

    /// Reopen an interrupted part: truncate to the checkpointed offset
    /// and rebuild row/hash state by decompressing the retained prefix.
    fn reopen(path: PathBuf, offsets: &PartOffsets) -> Result<Self, AtlasError> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(offsets.compressed_bytes)?;
        file.sync_all()?;

        let mut rows = 0u64;
        let mut uncompressed_bytes = 0u64;
        let mut hasher = Sha256::new();
        if offsets.compressed_bytes > 0 {
            let mut reader = File::open(&path)?;
            reader.seek(SeekFrom::Start(0))?;
            let mut decoder = Decoder::new(reader)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = decoder.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                uncompressed_bytes += n as u64;
                rows += buf[..n].iter().filter(|b| **b == b'\n').count() as u64;
            }
        }

        if rows != offsets.rows || uncompressed_bytes != offsets.uncompressed_bytes {
            let part = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Err(AtlasError::OffsetMismatch {
                part,
                detail: format!(
                    "checkpoint recorded {} rows / {} bytes, prefix holds {rows} rows / {uncompressed_bytes} bytes",
                    offsets.rows, offsets.uncompressed_bytes
                ),
            });
        }

        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;
        let encoder = Encoder::new(file, COMPRESSION_LEVEL)?;
        Ok(Self {
            path,
            encoder: Some(encoder),
            rows,
            uncompressed_bytes,
            hasher,
            flushed_compressed_bytes: offsets.compressed_bytes,
            rows_in_frame: 0,
        })
    }

    fn append(&mut self, line: &[u8]) -> Result<u64, AtlasError> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| AtlasError::Io(std::io::Error::other("part already closed")))?;
        encoder.write_all(line)?;
        encoder.write_all(b"\n")?;
        self.hasher.update(line);
        self.hasher.update(b"\n");
        let written = line.len() as u64 + 1;
        self.uncompressed_bytes += written;
        self.rows += 1;
        self.rows_in_frame += 1;
        Ok(written)
    }

    /// Finish the current frame and fsync, making everything appended so
    /// far durable and decompressible. Restarts a fresh frame for
    /// subsequent appends.
    fn flush_frame(&mut self) -> Result<PartOffsets, AtlasError> {
        if let Some(encoder) = self.encoder.take() {
            // An empty frame is still a valid frame; only skip when
            // nothing was appended since the last flush.
            if self.rows_in_frame > 0 {
                let file = encoder.finish()?;
                file.sync_all()?;
                self.flushed_compressed_bytes = file.metadata()?.len();
                self.rows_in_frame = 0;
                self.encoder = Some(Encoder::new(file, COMPRESSION_LEVEL)?);
            } else {
                self.encoder = Some(encoder);
            }
        }
        Ok(PartOffsets {
            compressed_bytes: self.flushed_compressed_bytes,
            rows: self.rows,
            uncompressed_bytes: self.uncompressed_bytes,
        })
    }

    fn finish(mut self, name: &str) -> Result<PartDescriptor, AtlasError> {
        if let Some(encoder) = self.encoder.take() {
            let file = encoder.finish()?;
            file.sync_all()?;
            self.flushed_compressed_bytes = file.metadata()?.len();
        }
        Ok(PartDescriptor {
            name: name.to_string(),
            row_count: self.rows,
            uncompressed_bytes: self.uncompressed_bytes,
            compressed_bytes: self.flushed_compressed_bytes,
            content_hash: hex::encode(self.hasher.finalize()),
        })
    }
}

/// Streaming writer for one Atlas archive directory
pub struct AtlasWriter {
    dir: PathBuf,
    parts: BTreeMap<String, PartWriter>,
    started_at: chrono::DateTime<chrono::Utc>,
    config_fingerprint: String,
}

impl AtlasWriter {
    /// Path of a part file within an archive directory
    #[must_use]
    pub fn part_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.jsonl.zst"))
    }

    /// Path of the manifest within an archive directory
    #[must_use]
    pub fn manifest_path(dir: &Path) -> PathBuf {
        dir.join("manifest.json")
    }

    /// Create a fresh archive with the built-in parts plus `aux_parts`
    pub fn create(
        dir: &Path,
        config_fingerprint: String,
        aux_parts: &[&str],
    ) -> Result<Self, AtlasError> {
        std::fs::create_dir_all(dir)?;
        // A manifest left by an earlier run in the same directory would
        // make the new, still-open archive look complete.
        let stale_manifest = Self::manifest_path(dir);
        if stale_manifest.exists() {
            std::fs::remove_file(stale_manifest)?;
        }
        let mut parts = BTreeMap::new();
        for name in BUILTIN_PARTS.iter().copied().chain(aux_parts.iter().copied()) {
            if parts.contains_key(name) {
                continue;
            }
            parts.insert(
                name.to_string(),
                PartWriter::create(Self::part_path(dir, name))?,
            );
        }
        info!("Created Atlas archive at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            parts,
            started_at: chrono::Utc::now(),
            config_fingerprint,
        })
    }

    /// Reopen an interrupted archive at the checkpointed offsets
    ///
    /// Trailing bytes past each recorded offset are truncated away; they
    /// belong to fetches whose completion was never checkpointed and
    /// which the resumed frontier will redo.
    pub fn reopen(
        dir: &Path,
        config_fingerprint: String,
        started_at: chrono::DateTime<chrono::Utc>,
        offsets: &BTreeMap<String, PartOffsets>,
        aux_parts: &[&str],
    ) -> Result<Self, AtlasError> {
        let mut parts = BTreeMap::new();
        for name in BUILTIN_PARTS.iter().copied().chain(aux_parts.iter().copied()) {
            if parts.contains_key(name) {
                continue;
            }
            let path = Self::part_path(dir, name);
            let writer = match offsets.get(name) {
                Some(part_offsets) if path.exists() => PartWriter::reopen(path, part_offsets)?,
                _ => PartWriter::create(path)?,
            };
            parts.insert(name.to_string(), writer);
        }
        info!("Reopened Atlas archive at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            parts,
            started_at,
            config_fingerprint,
        })
    }

    /// Append one record to a part. Acceptance order is row order.
    pub fn append<T: Serialize>(&mut self, part: &str, record: &T) -> Result<u64, AtlasError> {
        let writer = self
            .parts
            .get_mut(part)
            .ok_or_else(|| AtlasError::UnknownPart(part.to_string()))?;
        let line = serde_json::to_vec(record)?;
        writer.append(&line)
    }

    /// Make all appended rows durable and report per-part offsets for the
    /// checkpoint
    ///
    /// Frame finalization and fsync run via `tokio::task::spawn_blocking`
    /// so a flush never stalls the async runtime.
    pub async fn checkpoint_flush(&mut self) -> Result<BTreeMap<String, PartOffsets>, AtlasError> {
        let mut parts = std::mem::take(&mut self.parts);
        let blocking_task = tokio::task::spawn_blocking(
            move || -> Result<(BTreeMap<String, PartWriter>, BTreeMap<String, PartOffsets>), AtlasError> {
                let mut offsets = BTreeMap::new();
                for (name, writer) in &mut parts {
                    offsets.insert(name.clone(), writer.flush_frame()?);
                }
                Ok((parts, offsets))
            },
        );

        match timeout(BLOCKING_FLUSH_TIMEOUT, blocking_task).await {
            Ok(Ok(Ok((parts, offsets)))) => {
                self.parts = parts;
                debug!("Flushed {} parts for checkpoint", offsets.len());
                Ok(offsets)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => Err(AtlasError::Io(std::io::Error::other(format!(
                "blocking flush task panicked: {e}"
            )))),
            Err(_) => Err(AtlasError::Io(std::io::Error::other(format!(
                "frame flush timed out after {BLOCKING_FLUSH_TIMEOUT:?}"
            )))),
        }
    }

    #[must_use]
    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at
    }

    /// Finish all parts and write the manifest atomically
    ///
    /// The manifest is the archive's completeness marker, so it is
    /// written last, via a temp sibling and rename. A checkpoint file
    /// left from an interrupted run is removed. All of it runs on the
    /// blocking thread pool.
    pub async fn close(self) -> Result<AtlasManifest, AtlasError> {
        let blocking_task = tokio::task::spawn_blocking(move || self.close_sync());
        match timeout(BLOCKING_FLUSH_TIMEOUT, blocking_task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(AtlasError::Io(std::io::Error::other(format!(
                "blocking close task panicked: {e}"
            )))),
            Err(_) => Err(AtlasError::Io(std::io::Error::other(format!(
                "archive close timed out after {BLOCKING_FLUSH_TIMEOUT:?}"
            )))),
        }
    }

    fn close_sync(self) -> Result<AtlasManifest, AtlasError> {
        let mut descriptors = Vec::with_capacity(self.parts.len());
        for (name, writer) in self.parts {
            descriptors.push(writer.finish(&name)?);
        }
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));

        let audit_hash = compute_audit_hash(&descriptors);
        let manifest = AtlasManifest {
            atlas_version: ATLAS_VERSION,
            started_at: self.started_at,
            finished_at: chrono::Utc::now(),
            config_fingerprint: self.config_fingerprint,
            parts: descriptors,
            audit_hash,
        };

        let json = serde_json::to_vec_pretty(&manifest)?;
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(Self::manifest_path(&self.dir))
            .map_err(|e| AtlasError::Io(e.error))?;

        let checkpoint = self.dir.join("checkpoint.json");
        if checkpoint.exists() {
            let _ = std::fs::remove_file(checkpoint);
        }

        info!(
            "Closed Atlas archive at {} ({} parts, audit {})",
            self.dir.display(),
            manifest.parts.len(),
            &manifest.audit_hash[..12.min(manifest.audit_hash.len())]
        );
        Ok(manifest)
    }
}
