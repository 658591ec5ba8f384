//! One range transfer: GET with a `Range` header, `206` validation, body
//! streamed through a `BoundedWriter`.
//!
//! Fetchers never report failure to the coordinator: an error simply means no
//! more progress ticks arrive, and the coordinator restarts the slot on the
//! same segment. The two exceptions that cannot be fixed by restarting (the
//! server refusing partial content at offset zero, and disk failure) go out
//! on the fatal channel.

use std::cell::Cell;
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::request::RequestTemplate;

use super::writer::{BoundedWriter, WriteError};

/// Parameters for one transfer attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FetchSpec {
    /// Worker slot id (1-based), for log lines.
    pub slot: u32,
    /// First byte to fetch (the segment's cursor).
    pub begin: u64,
    /// Exclusive upper bound at spawn time.
    pub end: u64,
    /// Transport-level stall net: abort when throughput stays below
    /// 1 byte/sec for this long.
    pub read_timeout: Duration,
}

/// Run one range transfer to completion, cap, cancellation, or failure.
/// Blocking; run on the blocking pool.
pub(crate) fn fetch_range(
    request: &RequestTemplate,
    spec: FetchSpec,
    mut writer: BoundedWriter,
    cancel: Arc<AtomicBool>,
    fatal_tx: mpsc::Sender<anyhow::Error>,
) {
    debug_assert!(spec.begin < spec.end);
    let mut easy = match request.new_easy() {
        Ok(easy) => easy,
        Err(e) => {
            tracing::debug!(slot = spec.slot, error = %e, "could not build range request");
            return;
        }
    };
    let setup = (|| -> Result<(), curl::Error> {
        easy.range(&format!("{}-{}", spec.begin, spec.end - 1))?;
        easy.low_speed_limit(1)?;
        easy.low_speed_time(spec.read_timeout)
    })();
    if let Err(e) = setup {
        tracing::debug!(slot = spec.slot, error = %e, "could not configure range request");
        return;
    }

    // Status of the final response (redirect hops overwrite earlier ones).
    let status: Cell<Option<u32>> = Cell::new(None);
    let storage_error: Cell<Option<anyhow::Error>> = Cell::new(None);

    let perform_result = {
        let mut transfer = easy.transfer();
        let header_result = transfer.header_function(|data| {
            if let Ok(line) = str::from_utf8(data) {
                if let Some(code) = parse_status_line(line) {
                    status.set(Some(code));
                }
            }
            true
        });
        if let Err(e) = header_result {
            tracing::debug!(slot = spec.slot, error = %e, "header callback setup failed");
            return;
        }
        let write_result = transfer.write_function(|data| {
            if cancel.load(Ordering::Relaxed) {
                return Ok(0);
            }
            // Only a 206 body belongs in the file.
            if status.get() != Some(206) {
                return Ok(0);
            }
            match writer.write(data) {
                Ok(n) => Ok(n),
                Err(WriteError::LimitExceeded) | Err(WriteError::Closed) => Ok(0),
                Err(WriteError::Storage(e)) => {
                    storage_error.set(Some(e));
                    Ok(0)
                }
            }
        });
        if let Err(e) = write_result {
            tracing::debug!(slot = spec.slot, error = %e, "write callback setup failed");
            return;
        }
        transfer.perform()
    };

    if let Some(e) = storage_error.take() {
        let _ = fatal_tx.try_send(e.context("output write failed"));
        return;
    }
    if cancel.load(Ordering::Relaxed) {
        tracing::debug!(slot = spec.slot, "transfer cancelled");
        return;
    }

    let code = status.get();
    if spec.begin == 0 {
        if let Some(code) = code {
            if code >= 300 {
                let _ = fatal_tx.try_send(anyhow::anyhow!(
                    "unable to get partial content from server (HTTP {})",
                    code
                ));
                return;
            }
        }
    }

    match perform_result {
        _ if writer.limit_reached() => {
            tracing::debug!(slot = spec.slot, "segment cap reached");
        }
        Ok(()) if code == Some(206) => {
            tracing::debug!(slot = spec.slot, "range transfer complete");
        }
        Ok(()) => {
            tracing::debug!(slot = spec.slot, status = ?code, "non-partial response discarded");
        }
        Err(e) => {
            // Treated as a stall: the coordinator respawns this slot.
            tracing::debug!(slot = spec.slot, error = %e, "range transfer interrupted");
        }
    }
}

/// `"HTTP/1.1 206 Partial Content"` -> `Some(206)`.
fn parse_status_line(line: &str) -> Option<u32> {
    let line = line.trim_end();
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_parsed() {
        assert_eq!(parse_status_line("HTTP/1.1 206 Partial Content\r\n"), Some(206));
        assert_eq!(parse_status_line("HTTP/2 200 \r\n"), Some(200));
        assert_eq!(parse_status_line("Content-Length: 5\r\n"), None);
        assert_eq!(parse_status_line("HTTP/1.1 junk\r\n"), None);
    }
}
