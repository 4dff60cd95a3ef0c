//! Atlas Archive Module
//!
//! The self-describing, compressed, integrity-hashed archive a crawl
//! produces: streaming JSONL parts, a manifest binding their hashes, and
//! a verifying reader.

pub mod manifest;
pub mod reader;
pub mod records;
pub mod writer;

pub use manifest::{ATLAS_VERSION, AtlasManifest, PartDescriptor, compute_audit_hash};
pub use reader::AtlasReader;
pub use records::{
    AssetKind, AssetRecord, CrawlCounters, EdgeRecord, ErrorKind, ErrorPhase, ErrorRecord,
    LinkRel, PageRecord, PageTiming,
};
pub use writer::{AtlasError, AtlasWriter, BUILTIN_PARTS, PartOffsets};
