use super::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("strata_region_test_{}", rand::random::<u64>()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn open_in(dir: &Path, version: RegionFileVersion) -> RegionFile {
    RegionFile::open(dir.join("r.0.0.mca"), dir, version, false).unwrap()
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Sector ranges of all live records must be disjoint and outside the header.
fn assert_no_overlap(region: &RegionFile) {
    let mut ranges: Vec<(usize, usize)> = region
        .entries()
        .iter()
        .map(|entry| (entry.offset.sector(), entry.offset.sector() + entry.offset.count()))
        .collect();
    ranges.sort();
    for (start, _) in &ranges {
        assert!(*start >= 2, "record overlaps header: {ranges:?}");
    }
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "records overlap: {pair:?}");
    }
}

/// Writes a raw header + body and returns the region path.
fn write_raw_region(dir: &Path, header: &RegionHeader, body: &[u8]) -> PathBuf {
    let path = dir.join("r.0.0.mca");
    let mut data = header.as_bytes().to_vec();
    data.extend_from_slice(body);
    fs::write(&path, data).unwrap();
    path
}

#[test]
fn test_absent_chunk_reads_none() {
    let dir = temp_dir();
    let region = open_in(&dir, RegionFileVersion::Deflate);
    assert!(region.read_chunk(ChunkPos::new(3, 4)).unwrap().is_none());
    assert!(!region.does_chunk_exist(ChunkPos::new(3, 4)));
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_round_trip_every_codec() {
    let dir = temp_dir();
    for (i, version) in [
        RegionFileVersion::Gzip,
        RegionFileVersion::Deflate,
        RegionFileVersion::None,
        RegionFileVersion::Lz4,
    ]
    .into_iter()
    .enumerate()
    {
        let mut region =
            RegionFile::open(dir.join(format!("r.{i}.0.mca")), &dir, version, false).unwrap();
        for (x, len) in [(1, 1), (2, 4091), (3, 4092), (4, 70_000)] {
            let pos = ChunkPos::new(x, 7);
            let data = payload(len, x as u8);
            region.write_chunk(pos, &data).unwrap();
            assert_eq!(region.read_chunk(pos).unwrap(), Some(data), "{version:?} len {len}");
            assert!(region.does_chunk_exist(pos));
        }
        assert_no_overlap(&region);
    }
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_reopen_keeps_chunks_and_allocations() {
    let dir = temp_dir();
    let a = ChunkPos::new(0, 0);
    let b = ChunkPos::new(31, 31);
    {
        let mut region = open_in(&dir, RegionFileVersion::Deflate);
        region.write_chunk(a, &payload(10_000, 1)).unwrap();
        region.write_chunk(b, &payload(500, 2)).unwrap();
        region.close().unwrap();
    }

    let mut region = open_in(&dir, RegionFileVersion::Deflate);
    assert_eq!(region.read_chunk(a).unwrap(), Some(payload(10_000, 1)));
    assert_eq!(region.read_chunk(b).unwrap(), Some(payload(500, 2)));

    // New writes must not land on sectors rebuilt from the header
    region.write_chunk(ChunkPos::new(5, 5), &payload(3000, 3)).unwrap();
    assert_no_overlap(&region);
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_close_pads_to_full_sector() {
    let dir = temp_dir();
    let path = dir.join("r.0.0.mca");
    let mut region = open_in(&dir, RegionFileVersion::None);
    region.write_chunk(ChunkPos::new(0, 0), &payload(100, 0)).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), (HEADER_BYTES + CHUNK_HEADER_SIZE + 100) as u64);

    region.close().unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), 3 * SECTOR_BYTES as u64);
    // Second close is a no-op
    region.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_random_writes_and_clears_never_overlap() {
    let dir = temp_dir();
    let mut region = open_in(&dir, RegionFileVersion::None);
    let mut rng = StdRng::seed_from_u64(0x5EC7);
    let mut expected = std::collections::HashMap::new();

    for round in 0..300 {
        let pos = ChunkPos::new(rng.gen_range(0..8), rng.gen_range(0..8));
        if rng.gen_range(0..4) == 0 {
            region.clear(pos).unwrap();
            expected.remove(&pos);
        } else {
            let data = payload(rng.gen_range(0..20_000), round as u8);
            region.write_chunk(pos, &data).unwrap();
            expected.insert(pos, data);
        }
        assert_no_overlap(&region);
    }

    for (pos, data) in &expected {
        assert_eq!(region.read_chunk(*pos).unwrap().as_ref(), Some(data));
    }
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_external_threshold_boundary() {
    let dir = temp_dir();
    let mut region = open_in(&dir, RegionFileVersion::None);
    let internal = ChunkPos::new(1, 0);
    let external = ChunkPos::new(2, 0);

    // 5-byte record header + payload fills exactly 255 sectors
    let largest_internal = payload(255 * SECTOR_BYTES - CHUNK_HEADER_SIZE, 1);
    region.write_chunk(internal, &largest_internal).unwrap();
    assert_eq!(region.sector_offset(internal).count(), 255);
    assert!(!dir.join(internal.external_file_name()).exists());

    // One more byte needs a 256th sector
    let smallest_external = payload(255 * SECTOR_BYTES - CHUNK_HEADER_SIZE + 1, 2);
    region.write_chunk(external, &smallest_external).unwrap();
    assert_eq!(region.sector_offset(external).count(), 1);
    let external_path = dir.join(external.external_file_name());
    assert_eq!(fs::metadata(&external_path).unwrap().len(), smallest_external.len() as u64);
    assert!(!dir.join(format!("{}.tmp", external.external_file_name())).exists());

    assert_eq!(region.read_chunk(internal).unwrap(), Some(largest_internal));
    assert_eq!(region.read_chunk(external).unwrap(), Some(smallest_external.clone()));
    assert!(region.does_chunk_exist(external));
    assert_no_overlap(&region);

    // Survives a reopen
    region.close().unwrap();
    drop(region);
    let mut region = open_in(&dir, RegionFileVersion::None);
    assert_eq!(region.read_chunk(external).unwrap(), Some(smallest_external));

    // Shrinking back in-region removes the sidecar file
    region.write_chunk(external, b"small").unwrap();
    assert!(!external_path.exists());
    assert_eq!(region.read_chunk(external).unwrap(), Some(b"small".to_vec()));
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_clear_deletes_external_file() {
    let dir = temp_dir();
    let mut region = open_in(&dir, RegionFileVersion::None);
    let pos = ChunkPos::new(9, 9);
    region.write_chunk(pos, &payload(256 * SECTOR_BYTES, 0)).unwrap();
    let external_path = dir.join(pos.external_file_name());
    assert!(external_path.exists());

    region.clear(pos).unwrap();
    assert!(!external_path.exists());
    assert!(!region.has_chunk(pos));
    assert!(region.read_chunk(pos).unwrap().is_none());
    // Only the header remains allocated
    assert_eq!(region.used_sectors().used().collect::<Vec<_>>(), vec![0, 1]);
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_missing_external_file_reads_none() {
    let dir = temp_dir();
    let mut region = open_in(&dir, RegionFileVersion::None);
    let pos = ChunkPos::new(4, 4);
    region.write_chunk(pos, &payload(300 * SECTOR_BYTES, 0)).unwrap();
    fs::remove_file(dir.join(pos.external_file_name())).unwrap();

    assert!(!region.does_chunk_exist(pos));
    assert!(region.read_chunk(pos).unwrap().is_none());
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_rewrite_frees_old_sectors_only_after_commit() {
    let dir = temp_dir();
    let mut region = open_in(&dir, RegionFileVersion::None);
    let pos = ChunkPos::new(0, 0);
    let old = payload(100, 1);
    let new = payload(100, 2);

    region.write_chunk(pos, &old).unwrap();
    assert_eq!(region.sector_offset(pos), SectorOffset::new(2, 1));

    // The new record cannot reuse sector 2: it is still live while writing
    region.write_chunk(pos, &new).unwrap();
    assert_eq!(region.sector_offset(pos), SectorOffset::new(3, 1));
    assert!(!region.used_sectors().is_used(2));

    // State on disk right after the header commit: old bytes untouched in
    // sector 2, header already pointing at sector 3.
    let raw = fs::read(dir.join("r.0.0.mca")).unwrap();
    assert_eq!(&raw[2 * SECTOR_BYTES + CHUNK_HEADER_SIZE..][..100], &old[..]);
    let crashed = RegionHeader::from_bytes(&raw[..HEADER_BYTES]);
    assert_eq!(crashed.offset(0), SectorOffset::new(3, 1));

    // A crash before the free loses nothing: reopening reads the new data
    region.close().unwrap();
    drop(region);
    let region = open_in(&dir, RegionFileVersion::None);
    assert_eq!(region.read_chunk(pos).unwrap(), Some(new));
    assert!(!region.used_sectors().is_used(2));
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_corrupt_header_entries_are_zeroed_on_open() {
    let dir = temp_dir();
    let mut header = RegionHeader::empty();
    header.set_offset(0, SectorOffset::new(0, 1)); // collides with header
    header.set_offset(1, SectorOffset::new(1, 1)); // collides with header
    header.set_offset(2, SectorOffset::new(50, 1)); // past end of file
    header.set_offset(3, SectorOffset::new(2, 1)); // valid

    let mut body = vec![0u8; SECTOR_BYTES];
    body[..4].copy_from_slice(&4i32.to_be_bytes());
    body[4] = RegionFileVersion::None.id();
    body[5..8].copy_from_slice(b"abc");
    write_raw_region(&dir, &header, &body);

    let region = open_in(&dir, RegionFileVersion::None);
    for x in 0..3 {
        let pos = ChunkPos::new(x, 0);
        assert!(!region.has_chunk(pos));
        assert!(!region.does_chunk_exist(pos));
        assert!(region.read_chunk(pos).unwrap().is_none());
    }
    assert_eq!(region.read_chunk(ChunkPos::new(3, 0)).unwrap(), Some(b"abc".to_vec()));
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_damaged_records_read_as_absent() {
    let dir = temp_dir();
    let mut header = RegionHeader::empty();
    let mut body = vec![0u8; 4 * SECTOR_BYTES];

    // Slot 0, sector 2: declared length larger than one sector
    header.set_offset(0, SectorOffset::new(2, 1));
    body[..4].copy_from_slice(&5000i32.to_be_bytes());
    body[4] = RegionFileVersion::None.id();

    // Slot 1, sector 3: unknown codec
    header.set_offset(1, SectorOffset::new(3, 1));
    let at = SECTOR_BYTES;
    body[at..at + 4].copy_from_slice(&2i32.to_be_bytes());
    body[at + 4] = 42;

    // Slot 2, sector 4: zero length
    header.set_offset(2, SectorOffset::new(4, 1));

    // Slot 3, sector 5: negative length
    header.set_offset(3, SectorOffset::new(5, 1));
    let at = 3 * SECTOR_BYTES;
    body[at..at + 4].copy_from_slice(&(-7i32).to_be_bytes());
    body[at + 4] = RegionFileVersion::None.id();

    write_raw_region(&dir, &header, &body);
    let region = open_in(&dir, RegionFileVersion::None);
    for x in 0..4 {
        let pos = ChunkPos::new(x, 0);
        assert!(region.has_chunk(pos));
        assert!(!region.does_chunk_exist(pos), "slot {x}");
        assert!(region.read_chunk(pos).unwrap().is_none(), "slot {x}");
    }
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_record_truncated_by_end_of_file() {
    let dir = temp_dir();
    let mut header = RegionHeader::empty();
    header.set_offset(0, SectorOffset::new(2, 4));
    // Only 3 bytes of the record made it to disk
    write_raw_region(&dir, &header, &[0, 0, 0]);

    let region = open_in(&dir, RegionFileVersion::None);
    assert!(region.read_chunk(ChunkPos::new(0, 0)).unwrap().is_none());
    assert!(!region.does_chunk_exist(ChunkPos::new(0, 0)));
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_dropped_buffer_is_committed() {
    let dir = temp_dir();
    let mut region = open_in(&dir, RegionFileVersion::Deflate);
    let pos = ChunkPos::new(6, 1);
    {
        let mut writer = region.chunk_data_writer(pos);
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"region").unwrap();
    }
    assert_eq!(region.read_chunk(pos).unwrap(), Some(b"hello region".to_vec()));
    assert!(region.timestamp(pos) > 0);
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_buffer_dropped_while_panicking_is_discarded() {
    let dir = temp_dir();
    let mut region = open_in(&dir, RegionFileVersion::Deflate);
    let pos = ChunkPos::new(2, 9);
    region.write_chunk(pos, b"intact").unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut writer = region.chunk_data_writer(pos);
        writer.write_all(b"half written").unwrap();
        panic!("serialization failed");
    }));
    assert!(result.is_err());
    assert_eq!(region.read_chunk(pos).unwrap(), Some(b"intact".to_vec()));
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_open_requires_external_dir() {
    let dir = temp_dir();
    let missing = dir.join("missing");
    let path = dir.join("r.0.0.mca");
    assert!(RegionFile::open(path, &missing, RegionFileVersion::Deflate, false).is_err());
    fs::remove_dir_all(&dir).ok();
}
