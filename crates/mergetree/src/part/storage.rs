//! Storage I/O for part directories.
//!
//! A committed part lives in `{root}/{name}/data.part`. Parts are written into
//! `tmp_{name}` and become visible through a single directory rename; removal
//! renames to `delete_tmp_{name}` first so a crash never leaves a half-deleted
//! directory that still parses as a part.

use crate::error::{MergeTreeError, Result};
use crate::part::file::{read_part_file, write_part_file, DATA_FILE_NAME};
use crate::part::{PartInfo, PartMeta, Row};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Prefix of directories holding a part that has not been committed yet.
pub const TMP_PREFIX: &str = "tmp_";

/// Prefix of directories holding a part that is being removed.
pub const DELETE_TMP_PREFIX: &str = "delete_tmp_";

/// Result of scanning the storage root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartListing {
    /// Committed part directories, sorted.
    pub committed: Vec<PartInfo>,
    /// Leftover `tmp_*` / `delete_tmp_*` directories from interrupted work.
    pub leftovers: Vec<String>,
}

/// Storage collaborator used by the registry and the task executor.
///
/// Implementations must make [`PartStorage::commit_part`] atomic: after a
/// crash either the temporary directory or the committed one exists, never a
/// mix.
pub trait PartStorage: Send + Sync + fmt::Debug {
    /// Writes `rows` for `info` into a temporary location.
    fn write_part(&self, info: &PartInfo, rows: &[Row]) -> Result<PartMeta>;

    /// Atomically publishes a part previously written with `write_part`.
    fn commit_part(&self, info: &PartInfo) -> Result<()>;

    /// Drops the temporary output of an abandoned job.
    fn discard_temporary(&self, info: &PartInfo) -> Result<()>;

    /// Reads all rows of a committed part.
    fn read_part(&self, info: &PartInfo) -> Result<Vec<Row>>;

    /// Reads size and range statistics of a committed part.
    fn read_meta(&self, info: &PartInfo) -> Result<PartMeta>;

    /// Removes a committed part from storage.
    fn remove_part(&self, info: &PartInfo) -> Result<()>;

    /// Lists committed parts and leftovers.
    fn list_parts(&self) -> Result<PartListing>;

    /// Removes a leftover directory reported by `list_parts`.
    fn remove_leftover(&self, dir_name: &str) -> Result<()>;
}

/// Filesystem-backed [`PartStorage`].
///
/// # Examples
/// ```rust,ignore
/// use alopex_mergetree::part::{DiskStorage, PartInfo, PartStorage, Row};
///
/// let storage = DiskStorage::new("/data/table")?;
/// let info = PartInfo::new("all", 1, 1, 0);
/// storage.write_part(&info, &[Row::new(1, 0, 42)])?;
/// storage.commit_part(&info)?;
/// ```
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Opens (creating if needed) a storage root.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Returns the storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a committed part.
    pub fn part_dir(&self, info: &PartInfo) -> PathBuf {
        self.root.join(info.name())
    }

    fn tmp_dir(&self, info: &PartInfo) -> PathBuf {
        self.root.join(format!("{}{}", TMP_PREFIX, info.name()))
    }

    fn delete_tmp_dir(&self, info: &PartInfo) -> PathBuf {
        self.root.join(format!("{}{}", DELETE_TMP_PREFIX, info.name()))
    }

    fn sync_root(&self) {
        if let Err(err) = fs::File::open(&self.root).and_then(|dir| dir.sync_all()) {
            debug!("directory sync of {:?} failed: {}", self.root, err);
        }
    }
}

impl PartStorage for DiskStorage {
    fn write_part(&self, info: &PartInfo, rows: &[Row]) -> Result<PartMeta> {
        let dir = self.tmp_dir(info);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        let bytes = write_part_file(&dir.join(DATA_FILE_NAME), rows)?;
        Ok(PartMeta::from_rows(rows, bytes))
    }

    fn commit_part(&self, info: &PartInfo) -> Result<()> {
        let target = self.part_dir(info);
        if target.exists() {
            return Err(MergeTreeError::InvariantViolation(format!(
                "part directory {} already exists",
                info
            )));
        }
        fs::rename(self.tmp_dir(info), &target)?;
        self.sync_root();
        Ok(())
    }

    fn discard_temporary(&self, info: &PartInfo) -> Result<()> {
        match fs::remove_dir_all(self.tmp_dir(info)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn read_part(&self, info: &PartInfo) -> Result<Vec<Row>> {
        let path = self.part_dir(info).join(DATA_FILE_NAME);
        read_part_file(&path, &info.name())
    }

    fn read_meta(&self, info: &PartInfo) -> Result<PartMeta> {
        let path = self.part_dir(info).join(DATA_FILE_NAME);
        let bytes = fs::metadata(&path)?.len();
        let rows = read_part_file(&path, &info.name())?;
        Ok(PartMeta::from_rows(&rows, bytes))
    }

    fn remove_part(&self, info: &PartInfo) -> Result<()> {
        let staging = self.delete_tmp_dir(info);
        match fs::rename(self.part_dir(info), &staging) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("part {} already removed from storage", info);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        fs::remove_dir_all(&staging)?;
        Ok(())
    }

    fn list_parts(&self) -> Result<PartListing> {
        let mut listing = PartListing::default();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = match entry.file_name().to_str() {
                Some(name) => name.to_string(),
                None => continue,
            };
            if name.starts_with(TMP_PREFIX) || name.starts_with(DELETE_TMP_PREFIX) {
                listing.leftovers.push(name);
                continue;
            }
            match PartInfo::parse_name(&name) {
                Ok(info) => listing.committed.push(info),
                Err(_) => debug!("skipping non-part directory {}", name),
            }
        }
        listing.committed.sort();
        listing.leftovers.sort();
        Ok(listing)
    }

    fn remove_leftover(&self, dir_name: &str) -> Result<()> {
        if !(dir_name.starts_with(TMP_PREFIX) || dir_name.starts_with(DELETE_TMP_PREFIX)) {
            return Err(MergeTreeError::InvalidPartName(dir_name.to_string()));
        }
        match fs::remove_dir_all(self.root.join(dir_name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
