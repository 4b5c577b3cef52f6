use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct StorageMetrics {
    // Region reads
    pub total_chunks_read: AtomicUsize,
    pub total_read_time_us: AtomicU64,
    pub total_bytes_read: AtomicUsize,
    pub max_read_time_us: AtomicU64,

    // Region writes
    pub total_chunks_written: AtomicUsize,
    pub total_write_time_us: AtomicU64,
    pub total_bytes_written: AtomicUsize,
    pub total_external_writes: AtomicUsize,
    pub total_chunks_cleared: AtomicUsize,

    // Self-healed corruption
    pub total_corrupt_chunks: AtomicUsize,
    pub total_corrupt_header_entries: AtomicUsize,

    // Region file cache
    pub total_cache_hits: AtomicUsize,
    pub total_cache_misses: AtomicUsize,
    pub total_cache_evictions: AtomicUsize,

    // Session
    pub start_time: Option<Instant>,
    pub config_summary: String,
}

impl StorageMetrics {
    pub fn new(config_summary: String) -> Self {
        Self {
            start_time: Some(Instant::now()),
            config_summary,
            ..Default::default()
        }
    }

    pub fn record_read(&self, duration: Duration, bytes: usize) {
        self.total_chunks_read.fetch_add(1, Ordering::Relaxed);
        let us = duration.as_micros() as u64;
        self.total_read_time_us.fetch_add(us, Ordering::Relaxed);
        self.max_read_time_us.fetch_max(us, Ordering::Relaxed);
        self.total_bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self, duration: Duration, bytes: usize) {
        self.total_chunks_written.fetch_add(1, Ordering::Relaxed);
        self.total_write_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.total_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_external_write(&self) {
        self.total_external_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clear(&self) {
        self.total_chunks_cleared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_chunk(&self) {
        self.total_corrupt_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_header_entries(&self, count: usize) {
        self.total_corrupt_header_entries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.total_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.total_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_eviction(&self) {
        self.total_cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generate_report(&self) -> String {
        let uptime = self.start_time.unwrap_or_else(Instant::now).elapsed();

        let read = self.total_chunks_read.load(Ordering::Relaxed);
        let read_time = self.total_read_time_us.load(Ordering::Relaxed) as f64 / 1000.0; // ms
        let read_max = self.max_read_time_us.load(Ordering::Relaxed) as f64 / 1000.0; // ms
        let read_avg = if read > 0 { read_time / read as f64 } else { 0.0 };
        let read_kb = self.total_bytes_read.load(Ordering::Relaxed) as f64 / 1024.0;

        let written = self.total_chunks_written.load(Ordering::Relaxed);
        let write_time = self.total_write_time_us.load(Ordering::Relaxed) as f64 / 1000.0;
        let write_avg = if written > 0 { write_time / written as f64 } else { 0.0 };
        let written_kb = self.total_bytes_written.load(Ordering::Relaxed) as f64 / 1024.0;
        let external = self.total_external_writes.load(Ordering::Relaxed);
        let cleared = self.total_chunks_cleared.load(Ordering::Relaxed);

        let corrupt_chunks = self.total_corrupt_chunks.load(Ordering::Relaxed);
        let corrupt_entries = self.total_corrupt_header_entries.load(Ordering::Relaxed);

        let hits = self.total_cache_hits.load(Ordering::Relaxed);
        let misses = self.total_cache_misses.load(Ordering::Relaxed);
        let evictions = self.total_cache_evictions.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests > 0 {
            (hits as f64 / total_requests as f64) * 100.0
        } else {
            0.0
        };

        format!(
            "Strata Storage Report\n\
             =====================\n\
             Configuration: {}\n\
             Session Duration: {:.2?}\n\n\
             [Region Read]\n\
             Chunks Read: {}\n\
             Avg Time: {:.2} ms/chunk\n\
             Max Time: {:.2} ms\n\
             Bytes Read: {:.1} KB\n\n\
             [Region Write]\n\
             Chunks Written: {}\n\
             Avg Time: {:.2} ms/chunk\n\
             Bytes Written: {:.1} KB\n\
             External Chunks: {}\n\
             Chunks Cleared: {}\n\n\
             [Corruption]\n\
             Unreadable Chunks: {}\n\
             Healed Header Entries: {}\n\n\
             [Region Cache]\n\
             Hits: {}\n\
             Misses: {}\n\
             Evictions: {}\n\
             Hit Rate: {:.1}%\n",
            self.config_summary,
            uptime,
            read, read_avg, read_max, read_kb,
            written, write_avg, written_kb, external, cleared,
            corrupt_chunks, corrupt_entries,
            hits, misses, evictions, hit_rate
        )
    }
}
