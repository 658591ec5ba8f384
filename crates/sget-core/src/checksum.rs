//! Range hashing for the audit: SHA-1 over a byte window of the output file.
//!
//! Computed on demand, never inline with the download path.

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// SHA-1 of `file[begin..end)` as lowercase hex. Regions past EOF hash as if
/// they were zero-length (the server side hashes real bytes, so a short local
/// file simply fails the comparison).
pub fn sha1_range(file: &mut File, begin: u64, end: u64) -> Result<String> {
    let mut hasher = Sha1::new();
    file.seek(SeekFrom::Start(begin)).context("seek for range hash")?;
    let mut left = end.saturating_sub(begin);
    let mut buf = [0u8; BUF_SIZE];
    while left > 0 {
        let want = left.min(BUF_SIZE as u64) as usize;
        let n = file.read(&mut buf[..want]).context("read for range hash")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        left -= n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-1 of an in-memory range, hex-encoded. Shared by the tests' reference
/// values and the audit's expectations.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Open `path` read-only for range hashing.
pub fn open_for_hash(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("open {} for hashing", path.display()))
}
