use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use strata_anvil::storage::DEFAULT_MAX_OPEN_REGIONS;
use strata_anvil::{RegionFileStorage, RegionFileVersion};
use strata_metrics::StorageMetrics;

/// Data version written when nothing else is configured (1.17.1).
pub const DEFAULT_DATA_VERSION: i32 = 2730;

/// Current data version stamped on everything we write.
/// Can be overridden by STRATA_DATA_VERSION env var.
pub fn get_data_version() -> i32 {
    std::env::var("STRATA_DATA_VERSION")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_DATA_VERSION)
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub region_dir: PathBuf,
    pub data_version: i32,
    /// fsync region files after every header update
    pub sync_writes: bool,
    pub max_open_regions: NonZeroUsize,
    pub compression: RegionFileVersion,
}

impl StorageConfig {
    pub fn new(region_dir: impl Into<PathBuf>) -> Self {
        Self {
            region_dir: region_dir.into(),
            data_version: get_data_version(),
            sync_writes: false,
            max_open_regions: NonZeroUsize::new(DEFAULT_MAX_OPEN_REGIONS)
                .unwrap_or(NonZeroUsize::MIN),
            compression: RegionFileVersion::default(),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "dir={} data_version={} sync={} max_open={} compression={:?}",
            self.region_dir.display(),
            self.data_version,
            self.sync_writes,
            self.max_open_regions,
            self.compression
        )
    }

    pub fn open_region_storage(&self, metrics: Arc<StorageMetrics>) -> RegionFileStorage {
        RegionFileStorage::with_options(
            &self.region_dir,
            self.sync_writes,
            self.compression,
            self.max_open_regions,
            metrics,
        )
    }
}
