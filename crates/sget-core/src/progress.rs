//! Progress reporting for a download session (bytes done, rate, ETA).

/// Snapshot of download progress at one coordinator tick.
#[derive(Debug, Clone)]
pub struct ProgressStats {
    /// Bytes confirmed written so far.
    pub bytes_done: u64,
    /// Total file size in bytes.
    pub total_bytes: u64,
    /// Bytes confirmed since the previous snapshot.
    pub bytes_this_tick: u64,
    /// Time since download start (seconds).
    pub elapsed_secs: f64,
}

impl ProgressStats {
    /// Overall rate in bytes per second (0 when elapsed is 0).
    pub fn bytes_per_sec(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.bytes_done as f64 / self.elapsed_secs
    }

    /// Estimated seconds remaining (None when the rate is 0 and work remains).
    pub fn eta_secs(&self) -> Option<f64> {
        let remaining = self.total_bytes.saturating_sub(self.bytes_done);
        if remaining == 0 {
            return Some(0.0);
        }
        let rate = self.bytes_per_sec();
        if rate <= 0.0 {
            return None;
        }
        Some(remaining as f64 / rate)
    }

    /// Fraction complete in [0.0, 1.0].
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.bytes_done as f64 / self.total_bytes as f64).min(1.0)
    }
}

/// `1536` -> `"1.50 KiB"`. For log lines, not machine consumption.
pub fn human_bytes(size: f64) -> String {
    if size < 0.0 {
        return "-".to_string();
    }
    let mut size = size;
    for unit in ["B", "KiB", "MiB", "GiB", "TiB", "PiB"] {
        if size < 1024.0 {
            return format!("{:.2} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.2} EiB", size)
}
