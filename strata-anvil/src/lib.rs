//! Anvil region storage.
//!
//! This crate handles:
//! - Sector allocation inside region files
//! - The region file container format (header, records, external chunks)
//! - Record compression codecs
//! - A directory of region files with a bounded set of open handles

pub mod bitmap;
pub mod compression;
pub mod pos;
pub mod region;
pub mod storage;

pub use bitmap::RegionBitmap;
pub use compression::RegionFileVersion;
pub use pos::{ChunkPos, RegionPos, SectionPos};
pub use region::{ChunkBuffer, RegionFile};
pub use storage::RegionFileStorage;

/// Extension of region files.
pub const ANVIL_EXTENSION: &str = "mca";
