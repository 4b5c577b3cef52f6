//! Chunk persistence on top of Anvil region folders.
//!
//! This crate handles:
//! - The I/O worker that serializes all region access of one folder
//! - Per-section records cached by column (`SectionStorage`)
//! - Per-chunk entity lists with an empty-chunk cache (`EntityStorage`)
//! - Versioned upgrades of stored tags (`DataFixer`)
//! - Whole-chunk (de)serialization through a pluggable `ChunkSerializer`

pub mod chunk;
pub mod config;
pub mod datafix;
pub mod entity;
pub mod io;
pub mod section;
pub mod tag;
pub mod worker;

pub use chunk::{ChunkData, ChunkSerializer, ChunkStorage, NbtChunkSerializer};
pub use config::{StorageConfig, get_data_version};
pub use datafix::{DataFixType, DataFixer, FixerChain, NoopFixer};
pub use entity::{ChunkEntities, EntityCodec, EntityStorage};
pub use io::{ChunkIo, Pending};
pub use section::{SectionCodec, SectionRange, SectionStorage};
pub use worker::IoWorker;
