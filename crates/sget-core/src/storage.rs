//! Disk I/O for the output file.
//!
//! The output is opened read+write without truncation (resume must never
//! destroy data) and shared across worker slots through offset-anchored
//! writes (pwrite). There is no shared cursor and no lock on the file;
//! slots write disjoint ranges.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Writer for the download output file. Cheap to clone and safe to use from
/// multiple tasks; each `write_at` is independent.
#[derive(Clone)]
pub struct StorageWriter {
    file: Arc<File>,
    path: PathBuf,
}

impl StorageWriter {
    /// Open `path` for offset writes, creating it if missing. Existing bytes
    /// are kept; unwritten regions stay sparse.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open output file: {}", path.display()))?;
        Ok(StorageWriter {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Write all of `data` at `offset`. Does not move any shared cursor.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, offset)
            .with_context(|| format!("write of {} bytes at offset {} failed", data.len(), offset))
    }

    /// Non-Unix stub: seek + write on a cloned handle. Not concurrency-safe.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = (*self.file).try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)?;
        Ok(())
    }

    /// Flush file data to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("output sync failed")
    }

    /// Cut the file to `len` bytes (used when a restarted sequential transfer
    /// leaves stale bytes past the fresh body).
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .with_context(|| format!("truncate {} to {} bytes", self.path.display(), len))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Size of `path`, or 0 when it does not exist.
pub fn file_size(path: &Path) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
    }
}
