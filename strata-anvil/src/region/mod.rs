//! Region files (`r.<x>.<z>.mca`).
//!
//! A region file stores up to 32x32 chunks as variable-length, sector-aligned
//! records behind an 8 KiB header. Each record is
//! `[length:4 BE][version:1][compressed data]`, where the length counts the
//! version byte. Records that would need 256 sectors or more are moved to an
//! external `c.<x>.<z>.mcc` file and the region keeps a 5-byte stub.

mod header;

pub use header::{HeaderCorruption, RegionHeader, SectorOffset, ValidatedHeader, validate_header};

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use strata_metrics::StorageMetrics;

use crate::bitmap::RegionBitmap;
use crate::compression::{EXTERNAL_STREAM_FLAG, RegionFileVersion};
use crate::pos::ChunkPos;

pub const SECTOR_BYTES: usize = 4096; // minecraft uses 4096 bytes per sector
pub const HEADER_BYTES: usize = 8192; // header is 8192 bytes (2 sectors 8kb)
pub const CHUNK_SLOTS: usize = 1024; // 32x32 chunks in region

/// Length prefix plus version byte.
pub const CHUNK_HEADER_SIZE: usize = 5;

/// The sector count of a location entry is one byte, so this many sectors
/// (1 MiB) can no longer be stored inside the region.
pub const EXTERNAL_SECTOR_THRESHOLD: usize = 256;

pub const fn size_to_sectors(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR_BYTES)
}

fn now_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}

fn is_external_stream_chunk(version: u8) -> bool {
    version & EXTERNAL_STREAM_FLAG != 0
}

fn external_chunk_version(version: u8) -> u8 {
    version & !EXTERNAL_STREAM_FLAG
}

/// Occupied slot of a region, as listed by [`RegionFile::entries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionEntry {
    pub index: usize,
    pub offset: SectorOffset,
    pub timestamp: u32,
}

/// One open region file.
///
/// Every method takes `&self` or `&mut self`, so one region file has one
/// writer at a time. Call [`RegionFile::close`] to pad and sync the file;
/// dropping an open region closes it best-effort.
pub struct RegionFile {
    path: PathBuf,
    file: Option<File>,
    external_dir: PathBuf,
    version: RegionFileVersion,
    sync: bool,
    header: RegionHeader,
    used_sectors: RegionBitmap,
    metrics: Arc<StorageMetrics>,
}

impl RegionFile {
    pub fn open(
        path: impl AsRef<Path>,
        external_dir: impl AsRef<Path>,
        version: RegionFileVersion,
        sync: bool,
    ) -> Result<Self> {
        Self::open_with_metrics(path, external_dir, version, sync, Arc::default())
    }

    pub fn open_with_metrics(
        path: impl AsRef<Path>,
        external_dir: impl AsRef<Path>,
        version: RegionFileVersion,
        sync: bool,
        metrics: Arc<StorageMetrics>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let external_dir = external_dir.as_ref().to_path_buf();
        if !external_dir.is_dir() {
            bail!("Expected directory, got {}", external_dir.display());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open region file {}", path.display()))?;
        let file_len = file
            .metadata()
            .with_context(|| format!("Failed to stat region file {}", path.display()))?
            .len();

        let mut raw_header = vec![0u8; HEADER_BYTES];
        let read = read_fully_at(&file, 0, &mut raw_header)
            .with_context(|| format!("Failed to read header of {}", path.display()))?;

        let (header, used_sectors) = if read == 0 {
            // Fresh file: the header is written with the first chunk.
            let mut used_sectors = RegionBitmap::new();
            used_sectors.force(0, HEADER_BYTES / SECTOR_BYTES);
            (RegionHeader::empty(), used_sectors)
        } else {
            if read != HEADER_BYTES {
                log::warn!("Region file {} has truncated header: {}", path.display(), read);
            }
            let header = RegionHeader::from_bytes(&raw_header[..read]);
            let validated = validate_header(header, file_len);
            for corruption in &validated.corruptions {
                log::warn!("Region file {} has an {}", path.display(), corruption);
            }
            metrics.record_corrupt_header_entries(validated.corruptions.len());
            (validated.header, validated.used_sectors)
        };

        Ok(Self {
            path,
            file: Some(file),
            external_dir,
            version,
            sync,
            header,
            used_sectors,
            metrics,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> RegionFileVersion {
        self.version
    }

    pub fn used_sectors(&self) -> &RegionBitmap {
        &self.used_sectors
    }

    pub fn sector_offset(&self, pos: ChunkPos) -> SectorOffset {
        self.header.offset(pos.region_index())
    }

    pub fn has_chunk(&self, pos: ChunkPos) -> bool {
        !self.sector_offset(pos).is_empty()
    }

    /// Seconds since the Unix epoch of the last write or clear of `pos`.
    pub fn timestamp(&self, pos: ChunkPos) -> u32 {
        self.header.timestamp(pos.region_index())
    }

    /// Every occupied slot in header order.
    pub fn entries(&self) -> Vec<RegionEntry> {
        (0..CHUNK_SLOTS)
            .filter_map(|index| {
                let offset = self.header.offset(index);
                (!offset.is_empty()).then(|| RegionEntry {
                    index,
                    offset,
                    timestamp: self.header.timestamp(index),
                })
            })
            .collect()
    }

    fn external_chunk_path(&self, pos: ChunkPos) -> PathBuf {
        self.external_dir.join(pos.external_file_name())
    }

    fn file(&self) -> io::Result<&File> {
        self.file.as_ref().ok_or_else(|| {
            io::Error::other(format!("region file {} is closed", self.path.display()))
        })
    }

    /// Returns a decompressing reader over the chunk's payload.
    ///
    /// `Ok(None)` means the chunk is absent or its record is unusable; damage
    /// is logged and never returned as an error.
    pub fn chunk_data_reader(&self, pos: ChunkPos) -> Result<Option<Box<dyn Read>>> {
        let offset = self.sector_offset(pos);
        if offset.is_empty() {
            return Ok(None);
        }

        let expected = offset.count() * SECTOR_BYTES;
        let mut record = vec![0u8; expected];
        let read = read_fully_at(self.file()?, offset.byte_offset(), &mut record)
            .with_context(|| format!("Failed to read chunk {pos} from {}", self.path.display()))?;
        record.truncate(read);

        if record.len() < CHUNK_HEADER_SIZE {
            log::error!("Chunk {pos} header is truncated: expected {expected} but read {read}");
            self.metrics.record_corrupt_chunk();
            return Ok(None);
        }

        let declared = i32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let version = record[4];
        if declared == 0 {
            log::warn!("Chunk {pos} is allocated, but stream is missing");
            self.metrics.record_corrupt_chunk();
            return Ok(None);
        }

        let payload_len = declared as i64 - 1;
        if is_external_stream_chunk(version) {
            if payload_len != 0 {
                log::warn!("Chunk {pos} has both internal and external streams");
            }
            return self.external_chunk_reader(pos, external_chunk_version(version));
        }

        let available = (record.len() - CHUNK_HEADER_SIZE) as i64;
        if payload_len > available {
            log::error!(
                "Chunk {pos} stream is truncated: expected {payload_len} but read {available}"
            );
            self.metrics.record_corrupt_chunk();
            return Ok(None);
        }
        if payload_len < 0 {
            log::error!("Declared size {declared} of chunk {pos} is negative");
            self.metrics.record_corrupt_chunk();
            return Ok(None);
        }

        record.truncate(CHUNK_HEADER_SIZE + payload_len as usize);
        record.drain(..CHUNK_HEADER_SIZE);
        Ok(self.wrap_chunk_stream(pos, version, Cursor::new(record)))
    }

    fn external_chunk_reader(&self, pos: ChunkPos, version: u8) -> Result<Option<Box<dyn Read>>> {
        let path = self.external_chunk_path(pos);
        if !path.is_file() {
            log::error!("External chunk path {} is not file", path.display());
            self.metrics.record_corrupt_chunk();
            return Ok(None);
        }
        let file = File::open(&path)
            .with_context(|| format!("Failed to open external chunk {}", path.display()))?;
        Ok(self.wrap_chunk_stream(pos, version, file))
    }

    fn wrap_chunk_stream<R: Read + 'static>(
        &self,
        pos: ChunkPos,
        version: u8,
        stream: R,
    ) -> Option<Box<dyn Read>> {
        match RegionFileVersion::from_id(version) {
            Some(codec) => Some(Box::new(BufReader::new(codec.wrap_reader(stream)))),
            None => {
                log::error!("Chunk {pos} has invalid chunk stream version {version}");
                self.metrics.record_corrupt_chunk();
                None
            }
        }
    }

    /// Reads and decompresses the whole payload of a chunk.
    pub fn read_chunk(&self, pos: ChunkPos) -> Result<Option<Vec<u8>>> {
        let Some(mut reader) = self.chunk_data_reader(pos)? else {
            return Ok(None);
        };
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .with_context(|| format!("Failed to decompress chunk {pos}"))?;
        Ok(Some(data))
    }

    /// Checks that a readable record exists without decompressing it.
    pub fn does_chunk_exist(&self, pos: ChunkPos) -> bool {
        let offset = self.sector_offset(pos);
        if offset.is_empty() {
            return false;
        }

        let mut record = [0u8; CHUNK_HEADER_SIZE];
        let Ok(file) = self.file() else {
            return false;
        };
        match read_fully_at(file, offset.byte_offset(), &mut record) {
            Ok(CHUNK_HEADER_SIZE) => {}
            _ => return false,
        }

        let declared = i32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let version = record[4];
        if is_external_stream_chunk(version) {
            RegionFileVersion::is_valid_version(external_chunk_version(version))
                && self.external_chunk_path(pos).is_file()
        } else {
            if !RegionFileVersion::is_valid_version(version) || declared == 0 {
                return false;
            }
            let payload_len = declared as i64 - 1;
            payload_len >= 0 && payload_len <= (SECTOR_BYTES * offset.count()) as i64
        }
    }

    /// Starts a buffered write of `pos`; nothing reaches the file until the
    /// buffer is committed.
    pub fn chunk_data_writer(&mut self, pos: ChunkPos) -> ChunkBuffer<'_> {
        ChunkBuffer {
            region: self,
            pos,
            data: Vec::with_capacity(8096),
            committed: false,
        }
    }

    /// Compresses and stores a whole chunk payload.
    pub fn write_chunk(&mut self, pos: ChunkPos, data: &[u8]) -> Result<()> {
        let mut writer = self.chunk_data_writer(pos);
        writer.write_all(data)?;
        writer.commit()
    }

    /// Stores a complete record (`[length][version][payload]`).
    ///
    /// The new record is written and the header committed before the old
    /// sectors are released, so a crash in between never leaves the header
    /// pointing at reused space.
    pub(crate) fn write(&mut self, pos: ChunkPos, record: &[u8]) -> Result<()> {
        let index = pos.region_index();
        let old = self.header.offset(index);
        let size = record.len();
        let mut sectors = size_to_sectors(size);

        let start;
        let commit;
        if sectors >= EXTERNAL_SECTOR_THRESHOLD {
            let path = self.external_chunk_path(pos);
            log::warn!(
                "Saving oversized chunk {pos} ({size} bytes) to external file {}",
                path.display()
            );
            sectors = 1;
            start = self.used_sectors.allocate(sectors);
            let tmp = self.write_to_external_file(pos, &record[CHUNK_HEADER_SIZE..])?;
            commit = CommitOp::MoveExternal { from: tmp, to: path };
            let stub = self.external_stub();
            self.write_at(start * SECTOR_BYTES, &stub)?;
            self.metrics.record_external_write();
        } else {
            start = self.used_sectors.allocate(sectors);
            commit = CommitOp::DeleteExternal(self.external_chunk_path(pos));
            self.write_at(start * SECTOR_BYTES, record)?;
        }

        self.header.set_offset(index, SectorOffset::new(start, sectors));
        self.header.set_timestamp(index, now_timestamp());
        self.write_header()?;
        commit.run()?;
        if !old.is_empty() {
            self.used_sectors.free(old.sector(), old.count());
        }
        Ok(())
    }

    fn external_stub(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut stub = [0u8; CHUNK_HEADER_SIZE];
        stub[..4].copy_from_slice(&1i32.to_be_bytes());
        stub[4] = self.version.id() | EXTERNAL_STREAM_FLAG;
        stub
    }

    fn write_to_external_file(&self, pos: ChunkPos, payload: &[u8]) -> Result<PathBuf> {
        let tmp = self
            .external_dir
            .join(format!("{}.tmp", pos.external_file_name()));
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(payload)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(tmp)
    }

    /// Removes a chunk from the region.
    pub fn clear(&mut self, pos: ChunkPos) -> Result<()> {
        let index = pos.region_index();
        let old = self.header.offset(index);
        if old.is_empty() {
            return Ok(());
        }

        self.header.set_offset(index, SectorOffset::EMPTY);
        self.header.set_timestamp(index, now_timestamp());
        self.write_header()?;
        remove_if_exists(&self.external_chunk_path(pos))?;
        self.used_sectors.free(old.sector(), old.count());
        Ok(())
    }

    /// Syncs file contents and metadata to disk.
    pub fn flush(&self) -> Result<()> {
        self.file()?
            .sync_all()
            .with_context(|| format!("Failed to sync {}", self.path.display()))
    }

    /// Pads the file to a whole number of sectors, syncs and closes it.
    /// Later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let padded = pad_to_full_sector(&file);
        let synced = file.sync_all();
        padded.with_context(|| format!("Failed to pad {}", self.path.display()))?;
        synced.with_context(|| format!("Failed to sync {}", self.path.display()))?;
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        self.write_at(0, self.header.as_bytes())
            .with_context(|| format!("Failed to write header of {}", self.path.display()))
    }

    fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut file = self.file()?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(data)?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl Drop for RegionFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close region file {}: {:#}", self.path.display(), e);
        }
    }
}

/// Work that runs once the header points at the new record.
enum CommitOp {
    MoveExternal { from: PathBuf, to: PathBuf },
    DeleteExternal(PathBuf),
}

impl CommitOp {
    fn run(self) -> Result<()> {
        match self {
            Self::MoveExternal { from, to } => fs::rename(&from, &to)
                .with_context(|| format!("Failed to move {} to {}", from.display(), to.display())),
            Self::DeleteExternal(path) => remove_if_exists(&path),
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

fn read_fully_at(mut file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn pad_to_full_sector(mut file: &File) -> io::Result<()> {
    let len = file.metadata()?.len() as usize;
    let padded = size_to_sectors(len) * SECTOR_BYTES;
    if len != padded {
        file.seek(SeekFrom::Start(padded as u64 - 1))?;
        file.write_all(&[0])?;
    }
    Ok(())
}

/// Uncompressed chunk bytes waiting to be stored.
///
/// Created by [`RegionFile::chunk_data_writer`]. [`ChunkBuffer::commit`]
/// compresses the data and writes the record; a buffer dropped without
/// committing is committed on drop and failures are logged, unless the
/// thread is panicking.
pub struct ChunkBuffer<'a> {
    region: &'a mut RegionFile,
    pos: ChunkPos,
    data: Vec<u8>,
    committed: bool,
}

impl ChunkBuffer<'_> {
    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub fn commit(mut self) -> Result<()> {
        self.committed = true;
        self.store()
    }

    fn store(&mut self) -> Result<()> {
        let version = self.region.version;
        let mut record = Vec::with_capacity(self.data.len() / 2 + CHUNK_HEADER_SIZE);
        record.extend_from_slice(&[0, 0, 0, 0, version.id()]);
        version
            .encode_into(&self.data, &mut record)
            .with_context(|| format!("Failed to compress chunk {}", self.pos))?;
        let length = (record.len() - CHUNK_HEADER_SIZE + 1) as u32;
        record[..4].copy_from_slice(&length.to_be_bytes());
        self.region.write(self.pos, &record)
    }
}

impl Write for ChunkBuffer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ChunkBuffer<'_> {
    fn drop(&mut self) {
        // Unwinding means the data is likely incomplete
        if !self.committed && !std::thread::panicking() {
            self.committed = true;
            if let Err(e) = self.store() {
                log::error!("Failed to store chunk {}: {:#}", self.pos, e);
            }
        }
    }
}

#[cfg(test)]
mod tests;
