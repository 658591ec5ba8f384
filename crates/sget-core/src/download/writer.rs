//! Per-worker bounded writer: offset-anchored output writes, a dynamically
//! shrinkable upper bound, and per-chunk progress ticks.
//!
//! The bound is the cooperative hand-off for dynamic splits: when the
//! coordinator truncates a running segment, it sends the new exclusive end on
//! the limit channel, and this writer clamps at the next chunk boundary. The
//! HTTP body is consumed sequentially, so checking between chunks is enough.

use tokio::sync::mpsc;

use crate::storage::StorageWriter;

/// Why a write did not accept bytes.
#[derive(Debug)]
pub(crate) enum WriteError {
    /// The cap was reached; the body read must stop. Not a failure.
    LimitExceeded,
    /// The coordinator side is gone (stalled pump); stop silently.
    Closed,
    /// Disk write failed.
    Storage(anyhow::Error),
}

/// Streams one segment's body to the output file.
pub(crate) struct BoundedWriter {
    storage: StorageWriter,
    /// Absolute offset of the next byte to write.
    offset: u64,
    /// Absolute exclusive upper bound; only ever shrinks.
    limit: u64,
    progress_tx: mpsc::Sender<u64>,
    limit_rx: mpsc::Receiver<u64>,
}

impl BoundedWriter {
    pub(crate) fn new(
        storage: StorageWriter,
        begin: u64,
        limit: u64,
        progress_tx: mpsc::Sender<u64>,
        limit_rx: mpsc::Receiver<u64>,
    ) -> Self {
        BoundedWriter {
            storage,
            offset: begin,
            limit,
            progress_tx,
            limit_rx,
        }
    }

    /// Write one body chunk at the current offset, clamped to the bound.
    ///
    /// Every accepted byte is reported on the progress channel (blocking send:
    /// a slow coordinator back-pressures the transfer). Returns
    /// `LimitExceeded` once the cap is reached so the body read stops.
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if let Ok(new_limit) = self.limit_rx.try_recv() {
            self.limit = self.limit.min(new_limit);
        }
        if self.offset >= self.limit {
            return Err(WriteError::LimitExceeded);
        }
        let n = (data.len() as u64).min(self.limit - self.offset) as usize;
        self.storage
            .write_at(self.offset, &data[..n])
            .map_err(WriteError::Storage)?;
        self.offset += n as u64;
        if n > 0 && self.progress_tx.blocking_send(n as u64).is_err() {
            return Err(WriteError::Closed);
        }
        if self.offset >= self.limit {
            return Err(WriteError::LimitExceeded);
        }
        Ok(n)
    }

    /// True once the cap was reached; the transfer ended on purpose.
    pub(crate) fn limit_reached(&self) -> bool {
        self.offset >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn writer_over(
        dir: &tempfile::TempDir,
        begin: u64,
        limit: u64,
    ) -> (BoundedWriter, mpsc::Receiver<u64>, mpsc::Sender<u64>) {
        let storage = StorageWriter::open(&dir.path().join("out.bin")).unwrap();
        let (progress_tx, progress_rx) = mpsc::channel(16);
        let (limit_tx, limit_rx) = mpsc::channel(4);
        (
            BoundedWriter::new(storage, begin, limit, progress_tx, limit_rx),
            progress_rx,
            limit_tx,
        )
    }

    #[test]
    fn writes_at_offset_and_ticks_progress() {
        let dir = tempfile::tempdir().unwrap();
        let (mut w, mut progress_rx, _limit_tx) = writer_over(&dir, 10, 100);
        assert_eq!(w.write(b"abcd").unwrap(), 4);
        assert_eq!(w.write(b"ef").unwrap(), 2);
        assert_eq!(progress_rx.try_recv().unwrap(), 4);
        assert_eq!(progress_rx.try_recv().unwrap(), 2);
        let content = std::fs::read(dir.path().join("out.bin")).unwrap();
        assert_eq!(&content[10..16], b"abcdef");
        assert!(!w.limit_reached());
    }

    #[test]
    fn clamps_final_chunk_and_reports_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut w, mut progress_rx, _limit_tx) = writer_over(&dir, 0, 6);
        assert_eq!(w.write(b"abcd").unwrap(), 4);
        // 4 written, cap 6: chunk is clamped to 2 and the cap is reported
        assert!(matches!(w.write(b"wxyz"), Err(WriteError::LimitExceeded)));
        assert!(w.limit_reached());
        assert_eq!(progress_rx.try_recv().unwrap(), 4);
        assert_eq!(progress_rx.try_recv().unwrap(), 2);
        let content = std::fs::read(dir.path().join("out.bin")).unwrap();
        assert_eq!(&content, b"abcdwx");
    }

    #[test]
    fn shrunk_limit_stops_next_write() {
        let dir = tempfile::tempdir().unwrap();
        let (mut w, mut progress_rx, limit_tx) = writer_over(&dir, 0, 1000);
        assert_eq!(w.write(b"abcd").unwrap(), 4);
        // shrink below what is already written: zero further bytes
        limit_tx.try_send(3).unwrap();
        assert!(matches!(w.write(b"efgh"), Err(WriteError::LimitExceeded)));
        assert!(w.limit_reached());
        assert_eq!(progress_rx.try_recv().unwrap(), 4);
        assert!(progress_rx.try_recv().is_err(), "no tick for rejected write");
    }

    #[test]
    fn limit_can_only_shrink() {
        let dir = tempfile::tempdir().unwrap();
        let (mut w, _progress_rx, limit_tx) = writer_over(&dir, 0, 4);
        limit_tx.try_send(100).unwrap();
        assert!(matches!(w.write(b"abcdef"), Err(WriteError::LimitExceeded)));
        let content = std::fs::read(dir.path().join("out.bin")).unwrap();
        assert_eq!(&content, b"abcd", "grow attempt must not widen the cap");
    }

    #[test]
    fn closed_progress_channel_stops_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let (mut w, progress_rx, _limit_tx) = writer_over(&dir, 0, 100);
        drop(progress_rx);
        assert!(matches!(w.write(b"abcd"), Err(WriteError::Closed)));
    }
}
