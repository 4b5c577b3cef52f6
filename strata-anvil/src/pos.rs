//! Chunk, region and section coordinates.
//!
//! Chunks are 16x16 columns, regions group 32x32 chunks into one `.mca`
//! file, and sections are the 16-block-tall vertical slices of a column.

use std::fmt;

/// Side length of a region in chunks.
pub const REGION_SIZE: i32 = 32;

const SECTION_XZ_BITS: u32 = 22;
const SECTION_Y_BITS: u32 = 20;
const SECTION_XZ_MASK: i64 = (1 << SECTION_XZ_BITS) - 1;
const SECTION_Y_MASK: i64 = (1 << SECTION_Y_BITS) - 1;
const SECTION_X_SHIFT: u32 = SECTION_Y_BITS + SECTION_XZ_BITS; // 42
const SECTION_Z_SHIFT: u32 = SECTION_Y_BITS; // 20

/// Absolute chunk coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Packs both coordinates into one key: low 32 bits x, high 32 bits z.
    pub const fn as_long(self) -> i64 {
        (self.x as u32 as i64) | ((self.z as u32 as i64) << 32)
    }

    pub const fn from_long(packed: i64) -> Self {
        Self {
            x: packed as i32,
            z: (packed >> 32) as i32,
        }
    }

    pub const fn region_x(self) -> i32 {
        self.x >> 5
    }

    pub const fn region_z(self) -> i32 {
        self.z >> 5
    }

    pub const fn region(self) -> RegionPos {
        RegionPos::new(self.region_x(), self.region_z())
    }

    /// X inside the region (0..32).
    pub const fn region_local_x(self) -> i32 {
        self.x & (REGION_SIZE - 1)
    }

    /// Z inside the region (0..32).
    pub const fn region_local_z(self) -> i32 {
        self.z & (REGION_SIZE - 1)
    }

    /// Slot of this chunk in the region header (0..1024).
    pub const fn region_index(self) -> usize {
        (self.region_local_x() + self.region_local_z() * REGION_SIZE) as usize
    }

    /// Name of the sidecar file holding an oversized chunk.
    pub fn external_file_name(self) -> String {
        format!("c.{}.{}.mcc", self.x, self.z)
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// Region coordinates (chunk coordinates divided by 32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn file_name(self) -> String {
        format!("r.{}.{}.{}", self.x, self.z, crate::ANVIL_EXTENSION)
    }

    /// Parses `r.<x>.<z>.mca`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("r.")?;
        let rest = rest.strip_suffix(crate::ANVIL_EXTENSION)?.strip_suffix('.')?;
        let (x, z) = rest.split_once('.')?;
        Some(Self::new(x.parse().ok()?, z.parse().ok()?))
    }

    /// Absolute position of the chunk at a header slot of this region.
    pub const fn chunk_at(self, index: usize) -> ChunkPos {
        let local_x = (index as i32) & (REGION_SIZE - 1);
        let local_z = (index as i32) >> 5;
        ChunkPos::new(self.x * REGION_SIZE + local_x, self.z * REGION_SIZE + local_z)
    }

    pub const fn as_long(self) -> i64 {
        ChunkPos::new(self.x, self.z).as_long()
    }
}

/// Position of a 16x16x16 section, in section coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl SectionPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub const fn of(chunk: ChunkPos, y: i32) -> Self {
        Self::new(chunk.x, y, chunk.z)
    }

    /// Packs into 64 bits: x in the top 22, z in the next 22, y in the low 20.
    pub const fn as_long(self) -> i64 {
        ((self.x as i64 & SECTION_XZ_MASK) << SECTION_X_SHIFT)
            | ((self.z as i64 & SECTION_XZ_MASK) << SECTION_Z_SHIFT)
            | (self.y as i64 & SECTION_Y_MASK)
    }

    pub const fn from_long(packed: i64) -> Self {
        Self {
            x: (packed >> SECTION_X_SHIFT) as i32,
            y: ((packed << (64 - SECTION_Y_BITS)) >> (64 - SECTION_Y_BITS)) as i32,
            z: ((packed << SECTION_XZ_BITS) >> SECTION_X_SHIFT) as i32,
        }
    }

    pub const fn chunk(self) -> ChunkPos {
        ChunkPos::new(self.x, self.z)
    }

    /// Lowest block Y inside this section.
    pub const fn min_block_y(self) -> i32 {
        self.y << 4
    }
}

impl fmt::Display for SectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectionPos[{}, {}, {}]", self.x, self.y, self.z)
    }
}
