//! Durable log of mutation ledger changes.
//!
//! The log is a directory of segment files, each starting with a header and
//! followed by CRC-framed records:
//!
//! ```text
//! segment_{id:016x}.mlog
//! ┌──────────────────────────────────────────────────────────┐
//! │ magic "AMLG" | version u16 | segment id u64              │
//! │ created_at i64 | base_version u64                        │
//! ├──────────────────────────────────────────────────────────┤
//! │ len u32 | crc32 u32 | payload (len bytes)   (repeated)   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! `base_version` is the highest version assigned when the segment was
//! created, so versions stay monotonic after older segments are truncated.
//! Replay of a segment stops at the first torn or corrupt frame.

use crate::config::{MutationLogConfig, SyncMode};
use crate::error::{MergeTreeError, Result};
use crate::mutation::command::{
    decode_commands, encode_commands, put_string, MutationCommand, Reader,
};
use crate::part::BlockNumber;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const SEGMENT_PREFIX: &str = "segment";
const SEGMENT_EXTENSION: &str = "mlog";
const LOG_MAGIC: [u8; 4] = *b"AMLG";
const LOG_VERSION: u16 = 1;
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// A change to the mutation ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A mutation was submitted.
    Submit {
        /// Assigned version.
        version: u64,
        /// Submission time.
        create_time: SystemTime,
        /// Per-partition block fence.
        block_numbers: BTreeMap<String, BlockNumber>,
        /// Commands to apply.
        commands: Vec<MutationCommand>,
    },
    /// A mutation was killed before completion.
    Kill {
        /// Killed version.
        version: u64,
    },
    /// A finished mutation was garbage-collected.
    Remove {
        /// Removed version.
        version: u64,
    },
}

impl LogRecord {
    /// Version the record refers to.
    pub fn version(&self) -> u64 {
        match self {
            Self::Submit { version, .. } | Self::Kill { version } | Self::Remove { version } => {
                *version
            }
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Submit {
                version,
                create_time,
                block_numbers,
                commands,
            } => {
                buf.push(1);
                buf.extend_from_slice(&version.to_le_bytes());
                buf.extend_from_slice(&to_nanos(*create_time).to_le_bytes());
                buf.extend_from_slice(&(block_numbers.len() as u32).to_le_bytes());
                for (partition, block) in block_numbers {
                    put_string(&mut buf, partition);
                    buf.extend_from_slice(&block.to_le_bytes());
                }
                encode_commands(commands, &mut buf);
            }
            Self::Kill { version } => {
                buf.push(2);
                buf.extend_from_slice(&version.to_le_bytes());
            }
            Self::Remove { version } => {
                buf.push(3);
                buf.extend_from_slice(&version.to_le_bytes());
            }
        }
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let record = match reader.u8()? {
            1 => {
                let version = reader.u64()?;
                let create_time = from_nanos(reader.i64()?);
                let fences = reader.u32()? as usize;
                let mut block_numbers = BTreeMap::new();
                for _ in 0..fences {
                    let partition = reader.string()?;
                    block_numbers.insert(partition, reader.u64()?);
                }
                let commands = decode_commands(&mut reader)?;
                Self::Submit {
                    version,
                    create_time,
                    block_numbers,
                    commands,
                }
            }
            2 => Self::Kill {
                version: reader.u64()?,
            },
            3 => Self::Remove {
                version: reader.u64()?,
            },
            tag => {
                return Err(MergeTreeError::LogCorrupted(format!(
                    "unknown record tag {}",
                    tag
                )))
            }
        };
        if reader.remaining() != 0 {
            return Err(MergeTreeError::LogCorrupted(format!(
                "{} trailing bytes after record",
                reader.remaining()
            )));
        }
        Ok(record)
    }
}

fn to_nanos(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn from_nanos(nanos: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos.max(0) as u64)
}

/// Segment header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SegmentHeader {
    segment_id: u64,
    created_at: i64,
    base_version: u64,
}

impl SegmentHeader {
    const SIZE: usize = 30; // 4 + 2 + 8 + 8 + 8

    fn new(segment_id: u64, base_version: u64) -> Self {
        Self {
            segment_id,
            created_at: to_nanos(SystemTime::now()),
            base_version,
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&LOG_MAGIC)?;
        writer.write_all(&LOG_VERSION.to_le_bytes())?;
        writer.write_all(&self.segment_id.to_le_bytes())?;
        writer.write_all(&self.created_at.to_le_bytes())?;
        writer.write_all(&self.base_version.to_le_bytes())?;
        Ok(())
    }

    fn read_from(reader: &mut Reader<'_>) -> Result<Self> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(reader.take(4)?);
        if magic != LOG_MAGIC {
            return Err(MergeTreeError::InvalidMagic(magic));
        }
        let mut version = [0u8; 2];
        version.copy_from_slice(reader.take(2)?);
        let version = u16::from_le_bytes(version);
        if version != LOG_VERSION {
            return Err(MergeTreeError::UnsupportedVersion(version));
        }
        Ok(Self {
            segment_id: reader.u64()?,
            created_at: reader.i64()?,
            base_version: reader.u64()?,
        })
    }
}

/// Contents of one segment read at open time.
#[derive(Debug)]
struct SegmentContents {
    header: SegmentHeader,
    records: Vec<LogRecord>,
}

/// State rebuilt from the log directory.
#[derive(Debug, Default)]
pub struct Replay {
    /// All valid records in log order.
    pub records: Vec<LogRecord>,
    /// Highest version ever assigned, including truncated segments.
    pub max_version: u64,
}

/// Segmented, CRC-framed append-only log of [`LogRecord`]s.
///
/// Not thread-safe on its own; the mutation ledger serializes access.
#[derive(Debug)]
pub struct MutationLog {
    log_dir: PathBuf,
    current_segment: BufWriter<File>,
    current_segment_id: u64,
    current_segment_size: usize,
    /// Submitted versions per segment id, used by truncation.
    submitted: BTreeMap<u64, BTreeSet<u64>>,
    /// Killed versions per segment id, carried forward by truncation.
    killed: BTreeMap<u64, BTreeSet<u64>>,
    max_version: u64,
    config: MutationLogConfig,
}

impl MutationLog {
    /// Opens the log, replaying existing segments and starting a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or read, or the
    /// new segment cannot be written.
    pub fn open(log_dir: impl AsRef<Path>, config: MutationLogConfig) -> Result<(Self, Replay)> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir)?;

        let mut replay = Replay::default();
        let mut submitted = BTreeMap::new();
        let mut killed: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        let mut next_segment_id = 0;
        for (segment_id, path) in list_segments(&log_dir)? {
            next_segment_id = segment_id + 1;
            let contents = match read_segment(&path) {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("Skipping mutation log segment {}: {}", path.display(), e);
                    continue;
                }
            };
            replay.max_version = replay.max_version.max(contents.header.base_version);
            let versions: &mut BTreeSet<u64> = submitted.entry(segment_id).or_default();
            for record in contents.records {
                replay.max_version = replay.max_version.max(record.version());
                match &record {
                    LogRecord::Submit { version, .. } => {
                        versions.insert(*version);
                    }
                    LogRecord::Kill { version } => {
                        killed.entry(segment_id).or_default().insert(*version);
                    }
                    LogRecord::Remove { .. } => {}
                }
                replay.records.push(record);
            }
            debug!(
                "Replayed mutation log segment {} created at {} ({} submits)",
                contents.header.segment_id,
                contents.header.created_at,
                versions.len()
            );
        }

        let (current_segment, current_segment_size) =
            create_segment(&log_dir, next_segment_id, replay.max_version)?;
        submitted.insert(next_segment_id, BTreeSet::new());

        let log = Self {
            log_dir,
            current_segment,
            current_segment_id: next_segment_id,
            current_segment_size,
            submitted,
            killed,
            max_version: replay.max_version,
            config,
        };
        Ok((log, replay))
    }

    /// Highest version written so far.
    pub fn max_version(&self) -> u64 {
        self.max_version
    }

    /// Number of segment files currently on disk.
    pub fn segment_count(&self) -> usize {
        self.submitted.len()
    }

    /// Appends a record and syncs it according to the configured mode.
    ///
    /// The record is durable when this returns `Ok`.
    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let data = record.to_bytes();
        if data.len() > MAX_RECORD_SIZE {
            return Err(MergeTreeError::InvalidConfig(format!(
                "mutation record of {} bytes exceeds the {} byte limit",
                data.len(),
                MAX_RECORD_SIZE
            )));
        }
        if self.current_segment_size + data.len() + 8 > self.config.segment_size
            && self.current_segment_size > SegmentHeader::SIZE
        {
            self.rotate_segment()?;
        }

        let crc = crc32fast::hash(&data);
        self.current_segment
            .write_all(&(data.len() as u32).to_le_bytes())?;
        self.current_segment.write_all(&crc.to_le_bytes())?;
        self.current_segment.write_all(&data)?;
        self.current_segment.flush()?;
        match self.config.sync_mode {
            SyncMode::Fsync => self.current_segment.get_ref().sync_all()?,
            SyncMode::Fdatasync => self.current_segment.get_ref().sync_data()?,
            SyncMode::None => {}
        }
        self.current_segment_size += 8 + data.len();

        self.max_version = self.max_version.max(record.version());
        match record {
            LogRecord::Submit { version, .. } => {
                self.submitted
                    .entry(self.current_segment_id)
                    .or_default()
                    .insert(*version);
            }
            LogRecord::Kill { version } => {
                self.killed
                    .entry(self.current_segment_id)
                    .or_default()
                    .insert(*version);
            }
            LogRecord::Remove { .. } => {}
        }
        Ok(())
    }

    fn rotate_segment(&mut self) -> Result<()> {
        self.current_segment.flush()?;
        self.current_segment.get_ref().sync_all()?;

        let segment_id = self.current_segment_id + 1;
        let (writer, size) = create_segment(&self.log_dir, segment_id, self.max_version)?;
        self.current_segment = writer;
        self.current_segment_id = segment_id;
        self.current_segment_size = size;
        self.submitted.insert(segment_id, BTreeSet::new());
        debug!("Rotated mutation log to segment {}", segment_id);
        Ok(())
    }

    /// Deletes the oldest segments whose submitted versions are all dead.
    ///
    /// Only a prefix of non-current segments is removed, so a `Kill` or
    /// `Remove` record never outlives-by-omission the `Submit` it cancels.
    /// `Kill` records of removed segments are rewritten into the current
    /// segment first: killed versions stay killed after a restart.
    /// Returns the number of segments deleted.
    pub fn truncate(&mut self, is_live: impl Fn(u64) -> bool) -> Result<usize> {
        let mut removable = Vec::new();
        for (segment_id, versions) in &self.submitted {
            if *segment_id >= self.current_segment_id || versions.iter().any(|v| is_live(*v)) {
                break;
            }
            removable.push(*segment_id);
        }

        let carried: BTreeSet<u64> = removable
            .iter()
            .filter_map(|segment_id| self.killed.get(segment_id))
            .flatten()
            .copied()
            .collect();
        for version in &carried {
            self.append(&LogRecord::Kill { version: *version })?;
        }

        for segment_id in &removable {
            let path = segment_path(&self.log_dir, *segment_id);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            self.submitted.remove(segment_id);
            self.killed.remove(segment_id);
            debug!("Removed mutation log segment: {}", path.display());
        }
        Ok(removable.len())
    }
}

fn segment_path(log_dir: &Path, segment_id: u64) -> PathBuf {
    log_dir.join(format!(
        "{}_{:016x}.{}",
        SEGMENT_PREFIX, segment_id, SEGMENT_EXTENSION
    ))
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix(&format!("{}_", SEGMENT_PREFIX)))
        .and_then(|s| u64::from_str_radix(s, 16).ok())
}

fn list_segments(log_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        if let Some(segment_id) = parse_segment_id(&path) {
            segments.push((segment_id, path));
        }
    }
    segments.sort_by_key(|(segment_id, _)| *segment_id);
    Ok(segments)
}

fn create_segment(
    log_dir: &Path,
    segment_id: u64,
    base_version: u64,
) -> Result<(BufWriter<File>, usize)> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(segment_path(log_dir, segment_id))?;
    let mut writer = BufWriter::new(file);
    SegmentHeader::new(segment_id, base_version).write_to(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok((writer, SegmentHeader::SIZE))
}

fn read_segment(path: &Path) -> Result<SegmentContents> {
    let bytes = fs::read(path)?;
    let mut reader = Reader::new(&bytes);
    let header = SegmentHeader::read_from(&mut reader)?;

    let mut records = Vec::new();
    while reader.remaining() > 0 {
        match read_frame(&mut reader) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(
                    "Mutation log segment {} ends with an unreadable record after {} records: {}",
                    path.display(),
                    records.len(),
                    e
                );
                break;
            }
        }
    }
    Ok(SegmentContents { header, records })
}

fn read_frame(reader: &mut Reader<'_>) -> Result<LogRecord> {
    let len = reader.u32()? as usize;
    if len == 0 || len > MAX_RECORD_SIZE {
        return Err(MergeTreeError::LogCorrupted(format!(
            "invalid record length {}",
            len
        )));
    }
    let expected = reader.u32()?;
    let data = reader.take(len)?;
    let actual = crc32fast::hash(data);
    if actual != expected {
        return Err(MergeTreeError::ChecksumMismatch { expected, actual });
    }
    LogRecord::from_bytes(data)
}
