//! Hash audit: divide-and-conquer verification of downloaded bytes against
//! server-side SHA-1 range hashes.
//!
//! The file is checked window by window; a mismatching window is bisected
//! until leaves of at most `2 * min_chunk` remain, and mismatching leaves are
//! reopened in the segment ledger as pending coverage. After the audit, every
//! byte is either proven matching at min-chunk granularity or queued for
//! re-download by the next session.

use anyhow::{Context, Result};
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::checksum;
use crate::probe;
use crate::request::RequestTemplate;
use crate::segments::Segments;
use crate::statefile::StateFile;

/// Source of server-side range hashes. The HTTP implementation below queries
/// the download URL with `hash=sha1`; tests substitute an in-memory one.
pub trait RangeHasher {
    /// Hex SHA-1 of the server's bytes in `[begin, end)`.
    fn range_hash(&self, begin: u64, end: u64) -> Result<String>;
}

/// Asks the origin server for range hashes: GET with `Range: bytes=b-(e-1)`
/// and `hash=sha1` in the query string; the body is the hex digest.
pub struct HttpRangeHasher {
    request: RequestTemplate,
}

impl HttpRangeHasher {
    pub fn new(request: &RequestTemplate) -> Result<Self> {
        Ok(HttpRangeHasher {
            request: request.with_query_param("hash", "sha1")?,
        })
    }
}

impl RangeHasher for HttpRangeHasher {
    fn range_hash(&self, begin: u64, end: u64) -> Result<String> {
        let mut body: Vec<u8> = Vec::new();
        let mut easy = self.request.new_easy().context("build hash query")?;
        easy.range(&format!("{}-{}", begin, end.saturating_sub(1)))?;
        {
            let mut transfer = easy.transfer();
            transfer.write_function(|data| {
                body.extend_from_slice(data);
                Ok(data.len())
            })?;
            transfer.perform().context("hash query failed")?;
        }
        let code = easy.response_code().context("no response code")?;
        if !(200..300).contains(&code) {
            anyhow::bail!(
                "hash query for bytes {}-{} returned HTTP {}",
                begin,
                end,
                code
            );
        }
        Ok(String::from_utf8_lossy(&body).trim().to_string())
    }
}

/// Ranges the audit reopened.
#[derive(Debug, Default)]
pub struct AuditReport {
    pub windows_checked: u64,
    pub reopened: Vec<(u64, u64)>,
}

/// Audit `file` against `remote` in windows of `max_len` starting at `start`,
/// reopening mismatching leaves in `segments`. `max_len` must be a positive
/// power of two. Stops early (cleanly) when `interrupt` is set.
pub fn audit(
    file: &mut File,
    remote: &dyn RangeHasher,
    segments: &mut Segments,
    total: u64,
    max_len: u64,
    start: u64,
    interrupt: Option<&AtomicBool>,
) -> Result<AuditReport> {
    anyhow::ensure!(
        max_len > 0 && max_len.is_power_of_two(),
        "audit window must be a positive power of two, got {}",
        max_len
    );
    let mut report = AuditReport::default();
    let mut begin = start;
    while begin < total {
        if interrupt.map(|flag| flag.load(Ordering::Relaxed)).unwrap_or(false) {
            tracing::info!("audit interrupted after {} windows", report.windows_checked);
            break;
        }
        let end = begin.saturating_add(max_len).min(total);
        audit_window(file, remote, segments, begin, end, &mut report)?;
        report.windows_checked += 1;
        begin = end;
    }
    Ok(report)
}

fn audit_window(
    file: &mut File,
    remote: &dyn RangeHasher,
    segments: &mut Segments,
    begin: u64,
    end: u64,
    report: &mut AuditReport,
) -> Result<()> {
    let local = checksum::sha1_range(file, begin, end)?;
    let remote_hash = remote.range_hash(begin, end)?;
    let matches = local == remote_hash;
    tracing::debug!(begin, end, matches, "audited range");
    if matches {
        return Ok(());
    }
    if end - begin <= 2 * segments.min_chunk() {
        tracing::info!(begin, end, "corrupt range, queued for re-download");
        segments.remove(begin, end);
        report.reopened.push((begin, end));
        return Ok(());
    }
    let mid = begin + (end - begin) / 2;
    audit_window(file, remote, segments, begin, mid, report)?;
    audit_window(file, remote, segments, mid, end, report)
}

/// Full audit run for an output file: probe for the total, load the sidecar,
/// audit, and save the sidecar (also on failure, so already-reopened ranges
/// are not lost).
pub async fn audit_output(
    request: &RequestTemplate,
    output: &std::path::Path,
    min_chunk: u64,
    max_len: u64,
    start: u64,
    interrupt: Arc<AtomicBool>,
) -> Result<AuditReport> {
    let probed = {
        let request = request.clone();
        tokio::task::spawn_blocking(move || probe::probe(&request))
            .await
            .context("probe task join")??
    };
    if !probed.ranged {
        anyhow::bail!("server does not serve byte ranges; cannot hash-audit");
    }

    let state = StateFile::for_output(output);
    let mut segments = state.load(min_chunk)?;
    segments.init_size(probed.total);

    let remote = HttpRangeHasher::new(request)?;
    let mut file = checksum::open_for_hash(output)?;
    let total = probed.total;
    let (mut segments, result) = tokio::task::spawn_blocking(move || {
        let result = audit(
            &mut file,
            &remote,
            &mut segments,
            total,
            max_len,
            start,
            Some(&interrupt),
        );
        (segments, result)
    })
    .await
    .context("audit task join")?;

    let save_result = state.save(&mut segments).context("save state after audit");
    match result {
        Ok(report) => {
            save_result?;
            if report.reopened.is_empty() {
                tracing::info!("audit clean: {} windows verified", report.windows_checked);
            } else {
                tracing::warn!(
                    "audit reopened {} range(s); run the download again to repair",
                    report.reopened.len()
                );
            }
            Ok(report)
        }
        Err(e) => {
            if let Err(save_err) = save_result {
                tracing::error!("could not save state after failed audit: {:#}", save_err);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KIB: u64 = 1024;

    /// Serves hashes of a fixed "server side" body.
    struct MemoryHasher {
        body: Vec<u8>,
    }

    impl RangeHasher for MemoryHasher {
        fn range_hash(&self, begin: u64, end: u64) -> Result<String> {
            let begin = begin as usize;
            let end = (end as usize).min(self.body.len());
            Ok(checksum::sha1_hex(&self.body[begin..end]))
        }
    }

    fn write_temp(content: &[u8]) -> File {
        let mut f: File = tempfile::tempfile().unwrap();
        f.write_all(content).unwrap();
        f
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn clean_file_reopens_nothing() {
        let body = pattern(64 * KIB as usize);
        let mut file = write_temp(&body);
        let remote = MemoryHasher { body: body.clone() };
        let mut segments = Segments::new(4 * KIB);
        segments.init_size(body.len() as u64);
        let _ = segments.start(1).unwrap();
        while segments.advance(1, u64::MAX).is_ok() {}
        let report = audit(
            &mut file,
            &remote,
            &mut segments,
            body.len() as u64,
            16 * KIB,
            0,
            None,
        )
        .unwrap();
        assert_eq!(report.windows_checked, 4);
        assert!(report.reopened.is_empty());
        assert_eq!(segments.remaining(), 0);
    }

    // One corrupt 4 KiB block inside a 64 KiB file, audited with 16 KiB
    // windows and 1 KiB min chunk: the bisection isolates a 2 KiB leaf.
    #[test]
    fn corruption_is_isolated_to_a_leaf() {
        let body = pattern(64 * KIB as usize);
        let mut corrupted = body.clone();
        for b in &mut corrupted[20 * KIB as usize..24 * KIB as usize] {
            *b ^= 0xFF;
        }
        let mut file = write_temp(&corrupted);
        let remote = MemoryHasher { body };
        let mut segments = Segments::new(KIB);
        segments.init_size(64 * KIB);
        // ledger starts fully covered
        let _ = segments.start(1).unwrap();
        while segments.advance(1, u64::MAX).is_ok() {}
        assert_eq!(segments.remaining(), 0);

        let report = audit(
            &mut file,
            &remote,
            &mut segments,
            64 * KIB,
            16 * KIB,
            0,
            None,
        )
        .unwrap();
        // corrupt bytes are [20 KiB, 24 KiB); every reopened leaf is 2 KiB
        assert!(!report.reopened.is_empty());
        for (b, e) in &report.reopened {
            assert_eq!(e - b, 2 * KIB);
            assert!(*b >= 20 * KIB && *e <= 24 * KIB);
        }
        let reopened_total: u64 = report.reopened.iter().map(|(b, e)| e - b).sum();
        assert_eq!(reopened_total, 4 * KIB);
        assert_eq!(segments.remaining(), 4 * KIB);
    }

    // 1 MiB file, 256 KiB corrupt block at 512 KiB, audited in one 1 MiB
    // window with 128 KiB min chunk: [0, 1M) mismatches, [0, 512K) matches,
    // [512K, 1M) bisects, and [512K, 768K) is a mismatching leaf
    // (len == 2 * min_chunk) while [768K, 1M) matches.
    #[test]
    fn bisection_stops_at_twice_min_chunk() {
        let mib = 1024 * KIB;
        let body = pattern(mib as usize);
        let mut corrupted = body.clone();
        for b in &mut corrupted[512 * KIB as usize..768 * KIB as usize] {
            *b = b.wrapping_add(1);
        }
        let mut file = write_temp(&corrupted);
        let remote = MemoryHasher { body };
        let mut segments = Segments::new(128 * KIB);
        segments.init_size(mib);
        let _ = segments.start(1).unwrap();
        while segments.advance(1, u64::MAX).is_ok() {}

        let report = audit(&mut file, &remote, &mut segments, mib, mib, 0, None).unwrap();
        assert_eq!(report.reopened, vec![(512 * KIB, 768 * KIB)]);
        assert_eq!(segments.remaining(), 256 * KIB);
        assert_eq!(
            segments.serialize(),
            format!("0-{}-{},{}-{}-{}", mib, mib, 512 * KIB, 512 * KIB, 768 * KIB)
        );
    }

    #[test]
    fn window_length_must_be_power_of_two() {
        let body = pattern(KIB as usize);
        let mut file = write_temp(&body);
        let remote = MemoryHasher { body };
        let mut segments = Segments::new(KIB);
        assert!(audit(&mut file, &remote, &mut segments, KIB, 0, 0, None).is_err());
        assert!(audit(&mut file, &remote, &mut segments, KIB, 3 * KIB, 0, None).is_err());
    }

    #[test]
    fn interrupt_stops_between_windows() {
        let body = pattern(64 * KIB as usize);
        let mut file = write_temp(&body);
        let remote = MemoryHasher { body: body.clone() };
        let mut segments = Segments::new(KIB);
        segments.init_size(body.len() as u64);
        let flag = AtomicBool::new(true);
        let report = audit(
            &mut file,
            &remote,
            &mut segments,
            body.len() as u64,
            16 * KIB,
            0,
            Some(&flag),
        )
        .unwrap();
        assert_eq!(report.windows_checked, 0);
    }

    #[test]
    fn audit_respects_start_offset() {
        let body = pattern(32 * KIB as usize);
        let mut corrupted = body.clone();
        corrupted[0] ^= 0xFF; // corruption before `start` is not examined
        let mut file = write_temp(&corrupted);
        let remote = MemoryHasher { body };
        let mut segments = Segments::new(KIB);
        segments.init_size(32 * KIB);
        let _ = segments.start(1).unwrap();
        while segments.advance(1, u64::MAX).is_ok() {}
        let report = audit(
            &mut file,
            &remote,
            &mut segments,
            32 * KIB,
            16 * KIB,
            16 * KIB,
            None,
        )
        .unwrap();
        assert_eq!(report.windows_checked, 1);
        assert!(report.reopened.is_empty());
    }
}
