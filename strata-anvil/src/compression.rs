//! Compression codecs of chunk records.
//!
//! The fifth byte of every chunk record names the codec in its low 7 bits.
//! The high bit marks a stub whose payload lives in an external `.mcc` file.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use lz4_java_wrc::{Lz4BlockInput, Lz4BlockOutput};

/// Flag on the version byte: the payload is stored in an external file.
pub const EXTERNAL_STREAM_FLAG: u8 = 0x80;

/// Empty block closing an lz4 block stream: magic, a raw-method token for
/// 64 KiB blocks, then zero lengths and checksum.
const LZ4_END_BLOCK: [u8; 21] = *b"LZ4Block\x16\0\0\0\0\0\0\0\0\0\0\0\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum RegionFileVersion {
    Gzip = 1,
    /// Zlib-wrapped deflate, the default for new chunks.
    #[default]
    Deflate = 2,
    None = 3,
    Lz4 = 4,
}

impl RegionFileVersion {
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Gzip),
            2 => Some(Self::Deflate),
            3 => Some(Self::None),
            4 => Some(Self::Lz4),
            _ => None,
        }
    }

    pub fn is_valid_version(id: u8) -> bool {
        Self::from_id(id).is_some()
    }

    /// Parses a codec name as used on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "gzip" => Some(Self::Gzip),
            "deflate" | "zlib" => Some(Self::Deflate),
            "none" => Some(Self::None),
            "lz4" => Some(Self::Lz4),
            _ => None,
        }
    }

    /// Wraps a compressed stream into a decompressing reader.
    pub fn wrap_reader<'a, R: Read + 'a>(self, reader: R) -> Box<dyn Read + 'a> {
        match self {
            Self::Gzip => Box::new(GzDecoder::new(reader)),
            Self::Deflate => Box::new(ZlibDecoder::new(reader)),
            Self::None => Box::new(reader),
            Self::Lz4 => Box::new(Lz4BlockInput::new(reader)),
        }
    }

    /// Compresses `raw` and appends the result to `out`.
    pub fn encode_into(self, raw: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Self::Gzip => {
                let mut encoder = GzEncoder::new(out, Compression::default());
                encoder.write_all(raw)?;
                encoder.finish()?;
            }
            Self::Deflate => {
                let mut encoder = ZlibEncoder::new(out, Compression::default());
                encoder.write_all(raw)?;
                encoder.finish()?;
            }
            Self::None => out.extend_from_slice(raw),
            Self::Lz4 => {
                let mut encoder = Lz4BlockOutput::new(&mut *out);
                encoder.write_all(raw)?;
                encoder.flush()?;
                drop(encoder);
                // lz4-java readers require the end block
                out.extend_from_slice(&LZ4_END_BLOCK);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RegionFileVersion; 4] = [
        RegionFileVersion::Gzip,
        RegionFileVersion::Deflate,
        RegionFileVersion::None,
        RegionFileVersion::Lz4,
    ];

    #[test]
    fn test_codec_round_trip() {
        let raw: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        for version in ALL {
            let mut encoded = Vec::new();
            version.encode_into(&raw, &mut encoded).unwrap();

            let mut decoded = Vec::new();
            version.wrap_reader(encoded.as_slice()).read_to_end(&mut decoded).unwrap();
            assert_eq!(decoded, raw, "Mismatch for {version:?}");
        }
    }

    #[test]
    fn test_ids() {
        for version in ALL {
            assert_eq!(RegionFileVersion::from_id(version.id()), Some(version));
        }
        assert!(!RegionFileVersion::is_valid_version(0));
        assert!(!RegionFileVersion::is_valid_version(5));
        assert!(!RegionFileVersion::is_valid_version(2 | EXTERNAL_STREAM_FLAG));
        assert_eq!(RegionFileVersion::default(), RegionFileVersion::Deflate);
    }

    #[test]
    fn test_lz4_stream_is_terminated() {
        let raw = vec![7u8; 100_000];
        let mut encoded = Vec::new();
        RegionFileVersion::Lz4.encode_into(&raw, &mut encoded).unwrap();
        assert!(encoded.starts_with(b"LZ4Block"));
        let (_, tail) = encoded.split_at(encoded.len() - 21);
        assert_eq!(&tail[..8], b"LZ4Block");
        assert_eq!(tail[8] & 0xf0, 0x10);
        assert_eq!(&tail[9..], &[0; 12]);

        // Reading stops at the end block
        encoded.extend_from_slice(b"garbage");
        let mut decoded = Vec::new();
        RegionFileVersion::Lz4.wrap_reader(encoded.as_slice()).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn test_encode_appends() {
        let mut out = vec![0, 0, 0, 0, 3];
        RegionFileVersion::None.encode_into(b"abc", &mut out).unwrap();
        assert_eq!(out, vec![0, 0, 0, 0, 3, b'a', b'b', b'c']);
    }
}
