//! Sector allocation for region files.

use bitvec::vec::BitVec;

/// Tracks which 4 KiB sectors of a region file are occupied.
///
/// Allocation is first-fit and never fails: when no gap is large enough the
/// run is placed past the last known sector and the bitmap grows.
#[derive(Debug, Default, Clone)]
pub struct RegionBitmap {
    used: BitVec,
}

impl RegionBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `[start, start + size)` as used.
    pub fn force(&mut self, start: usize, size: usize) {
        let end = start + size;
        if self.used.len() < end {
            self.used.resize(end, false);
        }
        self.used[start..end].fill(true);
    }

    /// Marks `[start, start + size)` as free.
    pub fn free(&mut self, start: usize, size: usize) {
        let end = (start + size).min(self.used.len());
        if start < end {
            self.used[start..end].fill(false);
        }
    }

    /// Reserves the lowest run of `size` free sectors and returns its start.
    pub fn allocate(&mut self, size: usize) -> usize {
        let mut from = 0;
        loop {
            let start = self.used[from..]
                .first_zero()
                .map_or(self.used.len(), |offset| from + offset);
            match self.used[start..].first_one() {
                Some(gap) if gap < size => from = start + gap,
                _ => {
                    self.force(start, size);
                    return start;
                }
            }
        }
    }

    pub fn is_used(&self, sector: usize) -> bool {
        self.used.get(sector).map(|bit| *bit).unwrap_or(false)
    }

    /// Indices of all used sectors, ascending.
    pub fn used(&self) -> impl Iterator<Item = usize> + '_ {
        self.used.iter_ones()
    }
}
