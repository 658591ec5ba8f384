//! The download reactor: one task owns the segment ledger and multiplexes
//! worker progress on a one-second tick.
//!
//! Workers talk to the reactor only through channels: per-chunk byte counts
//! flow in (via a per-assignment pump), shrunk segment bounds flow out. All
//! ledger mutation happens here, so the set needs no lock.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::progress::{human_bytes, ProgressStats};
use crate::request::RequestTemplate;
use crate::segments::{SegmentError, Segments, Start};
use crate::statefile::StateFile;
use crate::storage::StorageWriter;

use super::fetcher::{self, FetchSpec};
use super::writer::BoundedWriter;

/// Reactor tuning, fixed for the session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReactorOpts {
    pub thread_count: usize,
    pub read_timeout: Duration,
}

/// One byte-count tick from a worker slot. The generation stamps which
/// assignment produced it, so ticks from an aborted transfer cannot be
/// credited to the slot's next segment.
#[derive(Debug, Clone, Copy)]
struct ProgressEvent {
    slot: usize,
    generation: u64,
    bytes: u64,
}

/// A running worker slot: the handle the reactor keeps to influence it.
struct SlotState {
    generation: u64,
    limit_tx: mpsc::Sender<u64>,
    cancel: Arc<AtomicBool>,
}

impl SlotState {
    /// Best-effort body close; a transfer that cannot be stopped is logged
    /// and abandoned (its writes are byte-identical or capped).
    fn abort(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// Drive `segments` to full coverage. Saves the state file on every exit
/// path: normal completion, fatal error, and interrupt.
pub(crate) async fn run(
    request: &RequestTemplate,
    segments: &mut Segments,
    storage: &StorageWriter,
    state: &StateFile,
    total: u64,
    opts: ReactorOpts,
) -> Result<()> {
    let result = Reactor::new(request, storage, opts).drive(segments, total).await;
    let save_result = state
        .save(segments)
        .context("save state file on session end");
    result.and(save_result)
}

struct Reactor<'a> {
    request: &'a RequestTemplate,
    storage: &'a StorageWriter,
    opts: ReactorOpts,
    event_tx: mpsc::Sender<ProgressEvent>,
    event_rx: mpsc::Receiver<ProgressEvent>,
    fatal_tx: mpsc::Sender<anyhow::Error>,
    fatal_rx: mpsc::Receiver<anyhow::Error>,
    slots: Vec<Option<SlotState>>,
    next_generation: u64,
}

impl<'a> Reactor<'a> {
    fn new(request: &'a RequestTemplate, storage: &'a StorageWriter, opts: ReactorOpts) -> Self {
        let thread_count = opts.thread_count.max(1);
        let (event_tx, event_rx) = mpsc::channel(thread_count * 8);
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        Reactor {
            request,
            storage,
            opts,
            event_tx,
            event_rx,
            fatal_tx,
            fatal_rx,
            slots: (0..thread_count).map(|_| None).collect(),
            next_generation: 0,
        }
    }

    async fn drive(&mut self, segments: &mut Segments, total: u64) -> Result<()> {
        for index in 0..self.slots.len() {
            self.assign(segments, index)?;
        }

        let started = Instant::now();
        let stall_ticks = self.opts.read_timeout.as_secs().max(1);
        let mut remaining = segments.remaining();

        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);

        'session: while remaining > 0 {
            let mut progressed = vec![false; self.slots.len()];
            let mut ticks = 0u64;
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick is immediate

            loop {
                loop {
                    tokio::select! {
                        Some(event) = self.event_rx.recv() => {
                            self.on_progress(segments, event, &mut progressed)?;
                        }
                        Some(error) = self.fatal_rx.recv() => {
                            return Err(error);
                        }
                        _ = ticker.tick() => break,
                        _ = &mut interrupt => {
                            tracing::info!("interrupt received, saving download state");
                            anyhow::bail!("interrupted");
                        }
                    }
                }

                let current = segments.remaining();
                let stats = ProgressStats {
                    bytes_done: total - current,
                    total_bytes: total,
                    bytes_this_tick: remaining.saturating_sub(current),
                    elapsed_secs: started.elapsed().as_secs_f64(),
                };
                tracing::info!(
                    "{} / {} ({:.1}%), {}/s",
                    human_bytes(stats.bytes_done as f64),
                    human_bytes(stats.total_bytes as f64),
                    stats.fraction() * 100.0,
                    human_bytes(stats.bytes_this_tick as f64),
                );
                remaining = current;
                if remaining == 0 {
                    break 'session;
                }

                // Idle slots retry every tick; a split becomes possible once
                // another slot's window has grown past 2 * min_chunk.
                for index in 0..self.slots.len() {
                    if self.slots[index].is_none() {
                        self.assign(segments, index)?;
                        progressed[index] = false;
                    }
                }

                ticks += 1;
                if ticks > stall_ticks {
                    self.restart_stalled(segments, &progressed);
                    break;
                }
            }
        }

        for slot in self.slots.iter().flatten() {
            slot.abort();
        }
        Ok(())
    }

    /// Apply one progress tick to the ledger; reassign the slot when its
    /// segment completed.
    fn on_progress(
        &mut self,
        segments: &mut Segments,
        event: ProgressEvent,
        progressed: &mut [bool],
    ) -> Result<()> {
        let current_generation = match &self.slots[event.slot] {
            Some(slot) => slot.generation,
            None => return Ok(()), // tick from a retired assignment
        };
        if event.generation != current_generation {
            return Ok(());
        }
        progressed[event.slot] = true;

        let owner = event.slot as u32 + 1;
        match segments.advance(owner, event.bytes) {
            Ok(_) => {}
            // The segment filled up (or shrank) before this tick landed.
            Err(SegmentError::Finished) | Err(SegmentError::AllFinished) => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("progress accounting for slot {}", owner)))
            }
        }

        if segments.assigned(owner).is_none() {
            if let Some(slot) = self.slots[event.slot].take() {
                slot.abort();
            }
            self.assign(segments, event.slot)?;
        }
        Ok(())
    }

    /// Hand slot `index` a segment if the ledger has one.
    fn assign(&mut self, segments: &mut Segments, index: usize) -> Result<()> {
        let owner = index as u32 + 1;
        match segments.start(owner).context("segment assignment")? {
            Start::Assigned(lease) => {
                if let Some(shrink) = lease.shrunk {
                    self.notify_shrink(shrink.owner, shrink.end);
                }
                self.spawn(index, lease.position, lease.end);
                Ok(())
            }
            Start::AlreadyRunning => {
                // The ledger says this slot still has work, but the reactor
                // has no transfer for it; the ledger is corrupt.
                anyhow::bail!("slot {} already holds a segment in the ledger", owner)
            }
            Start::AllFinished => {
                self.slots[index] = None;
                Ok(())
            }
        }
    }

    /// Deliver a shrunk upper bound to the donor slot. Loss is tolerable:
    /// the donor would only write byte-identical data up to its old end, and
    /// the ledger clamps its cursor at the new end.
    fn notify_shrink(&self, donor_owner: u32, new_end: u64) {
        let donor_index = donor_owner as usize - 1;
        match self.slots.get(donor_index).and_then(Option::as_ref) {
            Some(slot) => {
                if slot.limit_tx.try_send(new_end).is_err() {
                    tracing::debug!(slot = donor_owner, "shrink notification dropped");
                }
            }
            None => tracing::debug!(slot = donor_owner, "shrink for a slot with no transfer"),
        }
    }

    /// Restart every slot that made no progress across the whole window.
    fn restart_stalled(&mut self, segments: &Segments, progressed: &[bool]) {
        for index in 0..self.slots.len() {
            if progressed[index] || self.slots[index].is_none() {
                continue;
            }
            let owner = index as u32 + 1;
            let Some(lease) = segments.assigned(owner) else {
                continue;
            };
            tracing::warn!(
                slot = owner,
                position = lease.position,
                end = lease.end,
                "no progress within read timeout, restarting transfer"
            );
            if let Some(old) = self.slots[index].take() {
                old.abort();
            }
            self.spawn(index, lease.position, lease.end);
        }
    }

    /// Launch a fetcher for `[begin, end)` on slot `index`: a blocking curl
    /// transfer plus an async pump that forwards its ticks and gives up after
    /// a read-timeout of silence (which in turn stops the transfer, because
    /// the writer's next progress send fails).
    fn spawn(&mut self, index: usize, begin: u64, end: u64) {
        self.next_generation += 1;
        let generation = self.next_generation;

        let (progress_tx, mut progress_rx) = mpsc::channel::<u64>(8);
        let (limit_tx, limit_rx) = mpsc::channel::<u64>(4);
        let cancel = Arc::new(AtomicBool::new(false));

        let writer = BoundedWriter::new(self.storage.clone(), begin, end, progress_tx, limit_rx);
        let spec = FetchSpec {
            slot: index as u32 + 1,
            begin,
            end,
            read_timeout: self.opts.read_timeout,
        };
        let request = self.request.clone();
        let fatal_tx = self.fatal_tx.clone();
        let fetch_cancel = Arc::clone(&cancel);
        tokio::task::spawn_blocking(move || {
            fetcher::fetch_range(&request, spec, writer, fetch_cancel, fatal_tx);
        });

        let event_tx = self.event_tx.clone();
        let read_timeout = self.opts.read_timeout;
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(read_timeout, progress_rx.recv()).await {
                    Ok(Some(bytes)) => {
                        let event = ProgressEvent {
                            slot: index,
                            generation,
                            bytes,
                        };
                        if event_tx.send(event).await.is_err() {
                            break; // reactor gone
                        }
                    }
                    Ok(None) => break, // transfer over, writer dropped
                    Err(_) => break,   // stalled: dropping the receiver stops the writer
                }
            }
        });

        self.slots[index] = Some(SlotState {
            generation,
            limit_tx,
            cancel,
        });
    }
}
