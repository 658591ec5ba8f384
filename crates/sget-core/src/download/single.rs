//! Sequential fallback for servers without range support.
//!
//! One GET, resumed with a `Range: bytes={size}-` suffix when the output
//! already has bytes. A `206` appends; a plain `2xx` means the server ignored
//! the range, so the transfer restarts from zero. Transient failures retry
//! with backoff, re-reading the file size so a retry continues from wherever
//! the previous attempt stopped.

use anyhow::{Context, Result};
use std::cell::Cell;
use std::path::Path;
use std::str;
use std::time::{Duration, Instant};

use crate::progress::human_bytes;
use crate::request::RequestTemplate;
use crate::retry::{reconnect_loop, Backoff, TransferError};
use crate::storage::{self, StorageWriter};

/// Download `request`'s URL sequentially into `output`. `total` is the size
/// the probe reported; short transfers are retried.
pub(super) async fn download_single(
    request: &RequestTemplate,
    output: &Path,
    total: u64,
    read_timeout: Duration,
    resume: bool,
) -> Result<()> {
    let request = request.clone();
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || {
        reconnect_loop(&Backoff::default(), || {
            attempt(&request, &output, total, read_timeout, resume)
        })
        .map_err(|e| anyhow::Error::new(e).context("single-connection download failed"))
    })
    .await
    .context("single download task join")?
}

fn attempt(
    request: &RequestTemplate,
    output: &Path,
    total: u64,
    read_timeout: Duration,
    resume: bool,
) -> Result<(), TransferError> {
    let start = if resume {
        storage::file_size(output).map_err(TransferError::Storage)?
    } else {
        0
    };
    if resume && start >= total && total > 0 {
        tracing::info!("{} already complete", output.display());
        return Ok(());
    }
    let writer = StorageWriter::open(output).map_err(TransferError::Storage)?;

    let mut easy = request.new_easy().map_err(TransferError::Curl)?;
    if start > 0 {
        easy.range(&format!("{}-", start)).map_err(TransferError::Curl)?;
    }
    easy.low_speed_limit(1).map_err(TransferError::Curl)?;
    easy.low_speed_time(read_timeout).map_err(TransferError::Curl)?;

    let status: Cell<Option<u32>> = Cell::new(None);
    let storage_error: Cell<Option<anyhow::Error>> = Cell::new(None);
    // Offset of the next write; rebased to 0 when the server ignores the range.
    let offset = Cell::new(start);
    let restarted = Cell::new(false);
    let mut reporter = Reporter::new();

    let perform_result = {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(line) = str::from_utf8(data) {
                    let line = line.trim_end();
                    if line.starts_with("HTTP/") {
                        if let Some(code) =
                            line.split_whitespace().nth(1).and_then(|s| s.parse().ok())
                        {
                            status.set(Some(code));
                        }
                    }
                }
                true
            })
            .map_err(TransferError::Curl)?;
        transfer
            .write_function(|data| {
                match status.get() {
                    Some(206) => {}
                    Some(code) if (200..300).contains(&code) => {
                        if start > 0 && !restarted.get() {
                            tracing::warn!("server ignored the resume range, restarting from zero");
                            restarted.set(true);
                            offset.set(0);
                        }
                    }
                    // Error body; keep it out of the output file.
                    _ => return Ok(0),
                }
                match writer.write_at(offset.get(), data) {
                    Ok(()) => {
                        offset.set(offset.get() + data.len() as u64);
                        reporter.record(data.len() as u64);
                        Ok(data.len())
                    }
                    Err(e) => {
                        storage_error.set(Some(e));
                        Ok(0)
                    }
                }
            })
            .map_err(TransferError::Curl)?;
        transfer.perform()
    };

    if let Some(e) = storage_error.take() {
        return Err(TransferError::Storage(e));
    }
    let code = status.get().unwrap_or(0);
    if let Err(e) = perform_result {
        // A write-function abort over an error status is an HTTP failure,
        // not a transport one.
        if e.is_write_error() && code != 0 && !(200..300).contains(&code) {
            return Err(TransferError::Http(code));
        }
        return Err(TransferError::Curl(e));
    }
    if !(200..300).contains(&code) {
        return Err(TransferError::Http(code));
    }
    if restarted.get() {
        // Drop stale bytes past the fresh body.
        writer.truncate(offset.get()).map_err(TransferError::Storage)?;
    }
    if total > 0 && offset.get() != total {
        return Err(TransferError::Partial {
            expected: total,
            received: offset.get(),
        });
    }
    writer.sync().map_err(TransferError::Storage)?;
    tracing::info!(
        "finished {} ({})",
        output.display(),
        human_bytes(offset.get() as f64)
    );
    Ok(())
}

/// Once-per-second progress logging for the sequential path.
struct Reporter {
    last: Instant,
    since_last: u64,
    received: u64,
}

impl Reporter {
    fn new() -> Self {
        Reporter {
            last: Instant::now(),
            since_last: 0,
            received: 0,
        }
    }

    fn record(&mut self, bytes: u64) {
        self.received += bytes;
        self.since_last += bytes;
        let elapsed = self.last.elapsed();
        if elapsed < Duration::from_secs(1) {
            return;
        }
        tracing::info!(
            "{} received, {}/s",
            human_bytes(self.received as f64),
            human_bytes(self.since_last as f64 / elapsed.as_secs_f64()),
        );
        self.last = Instant::now();
        self.since_last = 0;
    }
}
