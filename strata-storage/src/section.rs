//! Per-section records (points of interest and similar), cached and written
//! back by whole chunk column.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use anyhow::{Result, bail};
use fastnbt::Value;
use log::{error, warn};
use strata_anvil::{ChunkPos, SectionPos};

use crate::datafix::{DataFixType, DataFixer};
use crate::io::ChunkIo;
use crate::tag;

/// Version assumed for columns written before versions were stamped.
pub const DEFAULT_SECTION_DATA_VERSION: i32 = 1945;

const SECTIONS_KEY: &str = "Sections";

/// Converts between records and their stored tags.
pub trait SectionCodec<R>: Send + Sync {
    /// A fresh record for a section that has none.
    fn create(&self, pos: SectionPos) -> R;

    fn decode(&self, pos: SectionPos, tag: &Value) -> Result<R>;

    fn encode(&self, pos: SectionPos, record: &R) -> Result<Value>;

    /// Called for every section decoded from disk.
    fn on_section_load(&self, _pos: SectionPos) {}
}

/// Vertical section range `[min, max)` stored per column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRange {
    min: i32,
    max: i32,
}

impl SectionRange {
    pub fn new(min: i32, max: i32) -> Result<Self> {
        if min >= max {
            bail!("Empty section range [{min}, {max})");
        }
        Ok(Self { min, max })
    }

    /// The sections covering block heights `[min_y, min_y + height)`.
    pub fn from_build_height(min_y: i32, height: i32) -> Result<Self> {
        if height <= 0 {
            bail!("Build height must be positive, got {height}");
        }
        Self::new(min_y >> 4, ((min_y + height - 1) >> 4) + 1)
    }

    pub fn min(self) -> i32 {
        self.min
    }

    pub fn max(self) -> i32 {
        self.max
    }

    pub fn contains(self, y: i32) -> bool {
        (self.min..self.max).contains(&y)
    }

    pub fn iter(self) -> std::ops::Range<i32> {
        self.min..self.max
    }
}

impl fmt::Display for SectionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

pub struct SectionStorage<R> {
    io: Arc<dyn ChunkIo>,
    codec: Box<dyn SectionCodec<R>>,
    fixer: Arc<dyn DataFixer>,
    fix_type: DataFixType,
    range: SectionRange,
    data_version: i32,
    // `None` means "known to be absent"
    storage: HashMap<i64, Option<R>>,
    dirty: DirtySet,
}

impl<R> SectionStorage<R> {
    pub fn new(
        io: Arc<dyn ChunkIo>,
        codec: Box<dyn SectionCodec<R>>,
        fixer: Arc<dyn DataFixer>,
        fix_type: DataFixType,
        range: SectionRange,
        data_version: i32,
    ) -> Self {
        Self {
            io,
            codec,
            fixer,
            fix_type,
            range,
            data_version,
            storage: HashMap::new(),
            dirty: DirtySet::default(),
        }
    }

    pub fn range(&self) -> SectionRange {
        self.range
    }

    /// Raw cache probe; never touches the disk.
    pub fn get(&self, pos: SectionPos) -> Option<&Option<R>> {
        self.storage.get(&pos.as_long())
    }

    pub fn get_or_load(&mut self, pos: SectionPos) -> Option<&R> {
        if !self.range.contains(pos.y) {
            return None;
        }
        let key = pos.as_long();
        if !self.storage.contains_key(&key) {
            self.read_column(pos.chunk());
        }
        self.storage.get(&key).and_then(Option::as_ref)
    }

    /// Returns the record, creating it if the section has none. A freshly
    /// created record is not dirty until [`set_dirty`](Self::set_dirty).
    pub fn get_or_create(&mut self, pos: SectionPos) -> Result<&mut R> {
        if !self.range.contains(pos.y) {
            bail!("Section {pos} is outside the stored range {}", self.range);
        }
        let key = pos.as_long();
        if !self.storage.contains_key(&key) {
            self.read_column(pos.chunk());
        }
        let slot = self.storage.entry(key).or_insert(None);
        Ok(slot.get_or_insert_with(|| self.codec.create(pos)))
    }

    /// Mutates the record (creating it if needed) and marks it dirty.
    pub fn modify<T>(&mut self, pos: SectionPos, f: impl FnOnce(&mut R) -> T) -> Result<T> {
        let result = f(self.get_or_create(pos)?);
        self.dirty.insert(pos.as_long());
        Ok(result)
    }

    pub fn set_dirty(&mut self, pos: SectionPos) {
        let key = pos.as_long();
        if matches!(self.storage.get(&key), Some(Some(_))) {
            self.dirty.insert(key);
        } else {
            warn!("No data for position: {pos}");
        }
    }

    pub fn has_work(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Writes back the column of the oldest dirty section while any section
    /// is dirty and `should_continue` agrees.
    pub fn tick(&mut self, mut should_continue: impl FnMut() -> bool) {
        while let Some(key) = self.dirty.oldest() {
            if !should_continue() {
                break;
            }
            self.write_column(SectionPos::from_long(key).chunk());
        }
    }

    /// Writes back `chunk`'s column if any of its sections is dirty.
    pub fn flush(&mut self, chunk: ChunkPos) {
        let dirty = self
            .range
            .iter()
            .any(|y| self.dirty.contains(SectionPos::of(chunk, y).as_long()));
        if dirty {
            self.write_column(chunk);
        }
    }

    /// Writes back every dirty column and closes the I/O worker.
    pub fn close(&mut self) -> Result<()> {
        self.tick(|| true);
        self.io.close()
    }

    fn read_column(&mut self, chunk: ChunkPos) {
        let tag = self.io.load(chunk).unwrap_or_else(|e| {
            error!("Error reading data from disk for {chunk}: {e:#}");
            None
        });

        let Some(tag) = tag else {
            for y in self.range.iter() {
                self.storage.insert(SectionPos::of(chunk, y).as_long(), None);
            }
            return;
        };

        let stored_version = tag::data_version(&tag).unwrap_or(DEFAULT_SECTION_DATA_VERSION);
        let upgraded = stored_version != self.data_version;
        let tag = self.fixer.update(self.fix_type, tag, stored_version, self.data_version);
        let sections = tag::get(&tag, SECTIONS_KEY);

        for y in self.range.iter() {
            let pos = SectionPos::of(chunk, y);
            let key = pos.as_long();
            let record = sections
                .and_then(|sections| tag::get(sections, &y.to_string()))
                .and_then(|section| match self.codec.decode(pos, section) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        error!("Failed to decode section {pos}: {e:#}");
                        None
                    }
                });

            let present = record.is_some();
            self.storage.insert(key, record);
            if present {
                self.codec.on_section_load(pos);
                if upgraded {
                    self.dirty.insert(key);
                }
            }
        }
    }

    fn write_column(&mut self, chunk: ChunkPos) {
        let mut sections = HashMap::new();
        for y in self.range.iter() {
            let pos = SectionPos::of(chunk, y);
            let key = pos.as_long();
            self.dirty.remove(key);
            if let Some(Some(record)) = self.storage.get(&key) {
                match self.codec.encode(pos, record) {
                    Ok(section) => {
                        sections.insert(y.to_string(), section);
                    }
                    Err(e) => error!("Failed to encode section {pos}: {e:#}"),
                }
            }
        }

        let column = tag::compound([
            (SECTIONS_KEY, Value::Compound(sections)),
            (tag::DATA_VERSION_KEY, Value::Int(self.data_version)),
        ]);
        // Failures are logged by the worker
        drop(self.io.store(chunk, Some(column)));
    }
}

/// Insertion-ordered set of dirty section keys with constant-time removal.
///
/// Removed keys stay in `order` until they reach the front or the queue is
/// compacted. An entry is live only while its sequence number matches.
#[derive(Default)]
struct DirtySet {
    members: HashMap<i64, u64>,
    order: VecDeque<(i64, u64)>,
    next_seq: u64,
}

impl DirtySet {
    fn insert(&mut self, key: i64) {
        if self.members.contains_key(&key) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.members.insert(key, seq);
        self.order.push_back((key, seq));
        if self.order.len() > 2 * self.members.len() + 64 {
            let members = &self.members;
            self.order.retain(|(key, seq)| members.get(key) == Some(seq));
        }
    }

    fn remove(&mut self, key: i64) {
        self.members.remove(&key);
    }

    fn contains(&self, key: i64) -> bool {
        self.members.contains_key(&key)
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Oldest live key; drops the stale entries in front of it.
    fn oldest(&mut self) -> Option<i64> {
        while let Some(&(key, seq)) = self.order.front() {
            if self.members.get(&key) == Some(&seq) {
                return Some(key);
            }
            self.order.pop_front();
        }
        None
    }
}
