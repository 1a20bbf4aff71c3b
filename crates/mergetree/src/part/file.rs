//! Part data file format.
//!
//! Every committed part directory holds a single `data.part` file:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  Header (16 bytes)                          │
//! │  - Magic: "AMTP" (4 bytes)                  │
//! │  - Version: u16 (2 bytes) = 1               │
//! │  - Reserved: 2 bytes                        │
//! │  - Row count: u64 (8 bytes)                 │
//! ├─────────────────────────────────────────────┤
//! │  Rows (25 bytes each, sorted by key)        │
//! │  - key u64, timestamp i64, value i64, sign  │
//! ├─────────────────────────────────────────────┤
//! │  Footer (8 bytes)                           │
//! │  - CRC32 of header + rows (4 bytes)         │
//! │  - Reverse magic: "PTMA" (4 bytes)          │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

use crate::error::{MergeTreeError, Result};
use crate::part::Row;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Magic bytes for the part file header: "AMTP"
pub const PART_MAGIC: [u8; 4] = *b"AMTP";

/// Reverse magic bytes for the part file footer: "PTMA"
pub const PART_MAGIC_REVERSE: [u8; 4] = *b"PTMA";

/// Current part file format version.
pub const PART_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Encoded size of one row.
pub const ROW_SIZE: usize = 25;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 8;

/// Name of the data file inside a part directory.
pub const DATA_FILE_NAME: &str = "data.part";

/// Part file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartFileHeader {
    /// Magic bytes: "AMTP"
    pub magic: [u8; 4],
    /// File format version.
    pub version: u16,
    /// Number of rows that follow.
    pub row_count: u64,
}

impl PartFileHeader {
    /// Creates a header for `row_count` rows.
    pub fn new(row_count: u64) -> Self {
        Self {
            magic: PART_MAGIC,
            version: PART_VERSION,
            row_count,
        }
    }

    /// Writes the header using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&[0u8; 2])?;
        writer.write_all(&self.row_count.to_le_bytes())?;
        Ok(())
    }

    /// Reads a header from a reader.
    ///
    /// # Errors
    ///
    /// Returns `MergeTreeError::InvalidMagic` if the magic bytes don't match and
    /// `MergeTreeError::UnsupportedVersion` for a newer format.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic = array::<4>(&buf[0..4]);
        if magic != PART_MAGIC {
            return Err(MergeTreeError::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes(array(&buf[4..6]));
        if version > PART_VERSION {
            return Err(MergeTreeError::UnsupportedVersion(version));
        }
        // Reserved (2 bytes) - ignored
        let row_count = u64::from_le_bytes(array(&buf[8..16]));

        Ok(Self {
            magic,
            version,
            row_count,
        })
    }
}

/// Serializes rows into the part file format.
pub fn encode_rows(rows: &[Row]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + rows.len() * ROW_SIZE + FOOTER_SIZE);
    PartFileHeader::new(rows.len() as u64).write_to(&mut buf)?;
    for row in rows {
        buf.extend_from_slice(&row.key.to_le_bytes());
        buf.extend_from_slice(&row.timestamp.to_le_bytes());
        buf.extend_from_slice(&row.value.to_le_bytes());
        buf.push(row.sign as u8);
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&PART_MAGIC_REVERSE);
    Ok(buf)
}

/// Decodes a part file image, verifying its footer checksum.
///
/// `part_name` is only used to label errors.
pub fn decode_rows(bytes: &[u8], part_name: &str) -> Result<Vec<Row>> {
    let corrupt = |reason: String| MergeTreeError::CorruptPart {
        name: part_name.to_string(),
        reason,
    };
    if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(corrupt(format!("file too short ({} bytes)", bytes.len())));
    }

    let body_len = bytes.len() - FOOTER_SIZE;
    let footer = &bytes[body_len..];
    if footer[4..8] != PART_MAGIC_REVERSE {
        return Err(corrupt("missing footer magic".to_string()));
    }
    let expected = u32::from_le_bytes(array(&footer[0..4]));
    let actual = crc32fast::hash(&bytes[..body_len]);
    if expected != actual {
        return Err(MergeTreeError::ChecksumMismatch { expected, actual });
    }

    let mut cursor = &bytes[..body_len];
    let header = PartFileHeader::read_from(&mut cursor)?;
    let expected_len = (header.row_count as usize).checked_mul(ROW_SIZE);
    if expected_len != Some(cursor.len()) {
        return Err(corrupt(format!(
            "header declares {} rows but body holds {} bytes",
            header.row_count,
            cursor.len()
        )));
    }

    let rows = cursor
        .chunks_exact(ROW_SIZE)
        .map(|chunk| Row {
            key: u64::from_le_bytes(array(&chunk[0..8])),
            timestamp: i64::from_le_bytes(array(&chunk[8..16])),
            value: i64::from_le_bytes(array(&chunk[16..24])),
            sign: chunk[24] as i8,
        })
        .collect();
    Ok(rows)
}

/// Writes `rows` to `path` and syncs the file. Returns the bytes written.
pub fn write_part_file(path: &Path, rows: &[Row]) -> Result<u64> {
    let bytes = encode_rows(rows)?;
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&bytes)?;
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    file.sync_all()?;
    Ok(bytes.len() as u64)
}

/// Reads and verifies the part file at `path`.
pub fn read_part_file(path: &Path, part_name: &str) -> Result<Vec<Row>> {
    let bytes = fs::read(path)?;
    decode_rows(&bytes, part_name)
}

fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}
