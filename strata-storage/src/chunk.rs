//! Whole-chunk persistence: versioned upgrade of the stored root, then a
//! pluggable mapping between the tag tree and an in-memory chunk.

use std::sync::Arc;

use anyhow::{Context, Result};
use fastnbt::Value;
use log::error;
use serde::{Deserialize, Serialize};
use strata_anvil::ChunkPos;

use crate::datafix::{DataFixType, DataFixer};
use crate::io::{ChunkIo, Pending};
use crate::tag;

/// Maps between a chunk's root tag and an in-memory chunk.
pub trait ChunkSerializer: Send + Sync {
    type Chunk;

    fn read(&self, pos: ChunkPos, root: &Value) -> Result<Self::Chunk>;

    fn write(&self, chunk: &Self::Chunk) -> Result<Value>;
}

/// Chunk root as stored in region files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkData {
    #[serde(rename = "DataVersion")]
    pub data_version: i32,

    // Absolute chunk coordinates
    #[serde(rename = "xPos")]
    pub x_pos: i32,
    #[serde(rename = "zPos")]
    pub z_pos: i32,
    #[serde(rename = "yPos", default)]
    pub y_pos: i32,

    #[serde(rename = "Status")]
    pub status: String,

    #[serde(rename = "LastUpdate", default)]
    pub last_update: i64,

    #[serde(rename = "InhabitedTime", default)]
    pub inhabited_time: i64,

    #[serde(rename = "isLightOn", default, skip_serializing_if = "Option::is_none")]
    pub is_light_on: Option<i8>,

    // Section contents are left to the caller
    #[serde(default)]
    pub sections: Vec<Value>,
}

impl ChunkData {
    pub fn pos(&self) -> ChunkPos {
        ChunkPos::new(self.x_pos, self.z_pos)
    }
}

/// [`ChunkSerializer`] for [`ChunkData`], going through the NBT encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct NbtChunkSerializer;

impl ChunkSerializer for NbtChunkSerializer {
    type Chunk = ChunkData;

    fn read(&self, pos: ChunkPos, root: &Value) -> Result<ChunkData> {
        let bytes = fastnbt::to_bytes(root)
            .with_context(|| format!("Failed to encode root of chunk {pos}"))?;
        let mut chunk: ChunkData =
            fastnbt::from_bytes(&bytes).with_context(|| format!("Malformed root of chunk {pos}"))?;

        if chunk.pos() != pos {
            let found = chunk.pos();
            error!("Chunk file at {pos} is in the wrong location; relocating (got {found})");
            chunk.x_pos = pos.x;
            chunk.z_pos = pos.z;
        }
        Ok(chunk)
    }

    fn write(&self, chunk: &ChunkData) -> Result<Value> {
        let bytes = fastnbt::to_bytes(chunk)
            .with_context(|| format!("Failed to encode chunk {}", chunk.pos()))?;
        fastnbt::from_bytes(&bytes)
            .with_context(|| format!("Failed to decode chunk {}", chunk.pos()))
    }
}

pub struct ChunkStorage<S> {
    io: Arc<dyn ChunkIo>,
    fixer: Arc<dyn DataFixer>,
    serializer: S,
    data_version: i32,
}

impl<S: ChunkSerializer> ChunkStorage<S> {
    pub fn new(
        io: Arc<dyn ChunkIo>,
        fixer: Arc<dyn DataFixer>,
        serializer: S,
        data_version: i32,
    ) -> Self {
        Self {
            io,
            fixer,
            serializer,
            data_version,
        }
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Raw root tag as stored.
    pub fn read(&self, pos: ChunkPos) -> Result<Option<Value>> {
        self.io.load(pos)
    }

    /// Runs the chunk fixes and stamps the current version on older roots.
    pub fn upgrade_chunk_tag(&self, root: Value) -> Value {
        let stored_version = tag::data_version(&root).unwrap_or(-1);
        let mut root =
            self.fixer.update(DataFixType::Chunk, root, stored_version, self.data_version);
        if stored_version < self.data_version {
            tag::set_data_version(&mut root, self.data_version);
        }
        root
    }

    pub fn load_chunk(&self, pos: ChunkPos) -> Result<Option<S::Chunk>> {
        let Some(root) = self.read(pos)? else {
            return Ok(None);
        };
        let root = self.upgrade_chunk_tag(root);
        self.serializer.read(pos, &root).map(Some)
    }

    pub fn save_chunk(&self, pos: ChunkPos, chunk: &S::Chunk) -> Result<Pending<()>> {
        let root = self.serializer.write(chunk)?;
        Ok(self.write(pos, root))
    }

    pub fn write(&self, pos: ChunkPos, root: Value) -> Pending<()> {
        self.io.store(pos, Some(root))
    }

    /// Blocks until every queued write is on disk and fsynced.
    pub fn flush_worker(&self) -> Result<()> {
        self.io.synchronize(true).wait()
    }

    pub fn close(&self) -> Result<()> {
        self.io.close()
    }
}
