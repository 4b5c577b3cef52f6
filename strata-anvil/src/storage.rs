//! A folder of region files with a bounded cache of open handles.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use fastnbt::Value;
use lru::LruCache;
use strata_metrics::StorageMetrics;

use crate::compression::RegionFileVersion;
use crate::pos::{ChunkPos, RegionPos};
use crate::region::RegionFile;

/// Region files kept open at once before the least recently used is closed.
pub const DEFAULT_MAX_OPEN_REGIONS: usize = 256;

/// Reads and writes chunk tags in a directory of `r.<x>.<z>.mca` files.
///
/// External `.mcc` files live in the same directory as the regions.
pub struct RegionFileStorage {
    folder: PathBuf,
    sync: bool,
    version: RegionFileVersion,
    cache: LruCache<RegionPos, RegionFile>,
    metrics: Arc<StorageMetrics>,
}

impl RegionFileStorage {
    pub fn new(folder: impl Into<PathBuf>, sync: bool) -> Self {
        Self::with_options(
            folder,
            sync,
            RegionFileVersion::default(),
            NonZeroUsize::new(DEFAULT_MAX_OPEN_REGIONS).unwrap_or(NonZeroUsize::MIN),
            Arc::default(),
        )
    }

    pub fn with_options(
        folder: impl Into<PathBuf>,
        sync: bool,
        version: RegionFileVersion,
        max_open: NonZeroUsize,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        Self {
            folder: folder.into(),
            sync,
            version,
            cache: LruCache::new(max_open),
            metrics,
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn metrics(&self) -> &Arc<StorageMetrics> {
        &self.metrics
    }

    pub fn open_regions(&self) -> usize {
        self.cache.len()
    }

    /// Returns the open region file, opening (and creating) it if needed.
    pub fn region(&mut self, region: RegionPos) -> Result<&mut RegionFile> {
        if self.cache.contains(&region) {
            self.metrics.record_cache_hit();
        } else {
            self.metrics.record_cache_miss();
            if self.cache.len() >= self.cache.cap().get() {
                if let Some((evicted_pos, mut evicted)) = self.cache.pop_lru() {
                    log::debug!("Closing region {} to make room", evicted_pos.file_name());
                    self.metrics.record_cache_eviction();
                    if let Err(e) = evicted.close() {
                        log::error!(
                            "Failed to close region file {}: {:#}",
                            evicted.path().display(),
                            e
                        );
                    }
                }
            }

            fs::create_dir_all(&self.folder).with_context(|| {
                format!("Failed to create region folder {}", self.folder.display())
            })?;
            let path = self.folder.join(region.file_name());
            let file = RegionFile::open_with_metrics(
                &path,
                &self.folder,
                self.version,
                self.sync,
                Arc::clone(&self.metrics),
            )?;
            self.cache.put(region, file);
        }

        self.cache
            .get_mut(&region)
            .with_context(|| format!("Region {} missing from cache", region.file_name()))
    }

    /// Loads and decodes a chunk tag; `Ok(None)` if absent or unreadable.
    pub fn read(&mut self, pos: ChunkPos) -> Result<Option<Value>> {
        let start = Instant::now();
        let metrics = Arc::clone(&self.metrics);
        let region = self.region(pos.region())?;
        let Some(data) = region.read_chunk(pos)? else {
            return Ok(None);
        };

        let tag: Value = fastnbt::from_bytes(&data)
            .with_context(|| format!("Failed to decode NBT of chunk {pos}"))?;
        metrics.record_read(start.elapsed(), data.len());
        Ok(Some(tag))
    }

    /// Encodes and stores a chunk tag, or deletes the chunk for `None`.
    pub fn write(&mut self, pos: ChunkPos, tag: Option<&Value>) -> Result<()> {
        let start = Instant::now();
        let metrics = Arc::clone(&self.metrics);
        let region = self.region(pos.region())?;
        match tag {
            None => {
                region.clear(pos)?;
                metrics.record_clear();
            }
            Some(tag) => {
                let data = fastnbt::to_bytes(tag)
                    .with_context(|| format!("Failed to encode NBT of chunk {pos}"))?;
                region.write_chunk(pos, &data)?;
                metrics.record_write(start.elapsed(), data.len());
            }
        }
        Ok(())
    }

    pub fn does_chunk_exist(&mut self, pos: ChunkPos) -> Result<bool> {
        Ok(self.region(pos.region())?.does_chunk_exist(pos))
    }

    /// Region files present in the folder, sorted by position.
    pub fn list_regions(&self) -> Result<Vec<RegionPos>> {
        if !self.folder.is_dir() {
            return Ok(Vec::new());
        }
        let mut regions = Vec::new();
        for entry in fs::read_dir(&self.folder)
            .with_context(|| format!("Failed to list {}", self.folder.display()))?
        {
            let entry = entry?;
            if let Some(pos) = entry.file_name().to_str().and_then(RegionPos::from_file_name) {
                regions.push(pos);
            }
        }
        regions.sort();
        Ok(regions)
    }

    /// Syncs every open region file.
    pub fn flush(&mut self) -> Result<()> {
        for (_, region) in self.cache.iter() {
            region.flush()?;
        }
        Ok(())
    }

    /// Closes every open region file, returning the first failure.
    pub fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some((_, mut region)) = self.cache.pop_lru() {
            if let Err(e) = region.close() {
                log::error!("Failed to close region file {}: {:#}", region.path().display(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("strata_storage_test_{}", rand::random::<u64>()))
    }

    fn chunk_tag(x: i32, z: i32) -> Value {
        let mut root = HashMap::new();
        root.insert("xPos".to_string(), Value::Int(x));
        root.insert("zPos".to_string(), Value::Int(z));
        root.insert("Status".to_string(), Value::String("minecraft:full".to_string()));
        Value::Compound(root)
    }

    #[test]
    fn test_write_read_across_regions() {
        let dir = temp_dir();
        let mut storage = RegionFileStorage::new(&dir, false);

        let positions = [ChunkPos::new(0, 0), ChunkPos::new(-1, -1), ChunkPos::new(40, 3)];
        for pos in positions {
            storage.write(pos, Some(&chunk_tag(pos.x, pos.z))).unwrap();
        }
        for pos in positions {
            assert_eq!(storage.read(pos).unwrap(), Some(chunk_tag(pos.x, pos.z)));
        }
        assert!(storage.read(ChunkPos::new(1, 1)).unwrap().is_none());
        assert_eq!(
            storage.list_regions().unwrap(),
            vec![RegionPos::new(-1, -1), RegionPos::new(0, 0), RegionPos::new(1, 0)]
        );

        storage.close().unwrap();
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_write_none_clears() {
        let dir = temp_dir();
        let mut storage = RegionFileStorage::new(&dir, false);
        let pos = ChunkPos::new(2, 2);
        storage.write(pos, Some(&chunk_tag(2, 2))).unwrap();
        assert!(storage.does_chunk_exist(pos).unwrap());

        storage.write(pos, None).unwrap();
        assert!(!storage.does_chunk_exist(pos).unwrap());
        assert!(storage.read(pos).unwrap().is_none());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_lru_eviction_closes_files() {
        let dir = temp_dir();
        let metrics = Arc::new(StorageMetrics::default());
        let mut storage = RegionFileStorage::with_options(
            &dir,
            false,
            RegionFileVersion::Deflate,
            NonZeroUsize::new(2).unwrap(),
            Arc::clone(&metrics),
        );

        for region_x in 0..4 {
            let pos = ChunkPos::new(region_x * 32, 0);
            storage.write(pos, Some(&chunk_tag(pos.x, 0))).unwrap();
        }
        assert_eq!(storage.open_regions(), 2);
        assert_eq!(metrics.total_cache_evictions.load(Ordering::Relaxed), 2);

        // Evicted regions were padded on close and reopen cleanly
        let evicted = dir.join(RegionPos::new(0, 0).file_name());
        assert_eq!(fs::metadata(&evicted).unwrap().len() % 4096, 0);
        assert_eq!(storage.read(ChunkPos::new(0, 0)).unwrap(), Some(chunk_tag(0, 0)));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_list_regions_of_missing_folder() {
        let storage = RegionFileStorage::new(temp_dir(), false);
        assert!(storage.list_regions().unwrap().is_empty());
    }
}
