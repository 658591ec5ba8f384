//! Ordered segment set covering `[0, total)`: assignment, split, compaction.

use super::{Segment, SegmentError};

/// Result of asking the set for work on behalf of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// A segment was assigned; fetch `[lease.position, lease.end)`.
    Assigned(Lease),
    /// The slot already owns an unfinished segment; nothing changed.
    AlreadyRunning,
    /// Every remaining byte is already owned and too small to split.
    AllFinished,
}

/// Snapshot of an assigned segment handed to a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub begin: u64,
    pub position: u64,
    pub end: u64,
    /// Present when the lease was carved out of a running segment; the donor
    /// slot must be told its new upper bound.
    pub shrunk: Option<Shrink>,
}

/// Notification that a running slot's segment was truncated by a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shrink {
    /// Slot whose segment shrank.
    pub owner: u32,
    /// Its new exclusive upper bound.
    pub end: u64,
}

/// The authoritative ledger of which bytes are pending, in flight, and done.
///
/// Owned exclusively by the download coordinator; workers see only the lease
/// they were handed. `min_chunk` is the smallest window worth dedicating a
/// connection to, and bounds both split grain and hash-audit resolution.
#[derive(Debug, Clone)]
pub struct Segments {
    segments: Vec<Segment>,
    min_chunk: u64,
}

impl Segments {
    /// New empty set.
    pub fn new(min_chunk: u64) -> Self {
        Segments {
            segments: Vec::new(),
            min_chunk: min_chunk.max(1),
        }
    }

    /// Parse the comma-separated state-file form. Empty input is an empty set.
    pub fn parse(text: &str, min_chunk: u64) -> Result<Self, SegmentError> {
        let mut segments = Vec::new();
        for token in text.split(',') {
            if token.trim().is_empty() {
                continue;
            }
            segments.push(token.parse::<Segment>()?);
        }
        Ok(Segments {
            segments,
            min_chunk: min_chunk.max(1),
        })
    }

    /// Canonical state-file form: compacted, sorted, comma-separated.
    pub fn serialize(&mut self) -> String {
        self.clean_overlap();
        let tokens: Vec<String> = self.segments.iter().map(|seg| seg.to_string()).collect();
        tokens.join(",")
    }

    /// Seed an empty set with the single segment `[0, total)`. No-op when the
    /// set already has content (resumed download).
    pub fn init_size(&mut self, total: u64) {
        if self.segments.is_empty() {
            self.segments.push(Segment::new(0, total));
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn min_chunk(&self) -> u64 {
        self.min_chunk
    }

    /// Sum of untransferred bytes. Zero iff the set is fully covered.
    pub fn remaining(&self) -> u64 {
        self.segments.iter().map(Segment::remaining).sum()
    }

    /// Largest `end` of any segment; the set's coverage bound.
    pub fn coverage_end(&self) -> u64 {
        self.segments.iter().map(Segment::end).max().unwrap_or(0)
    }

    /// The unfinished segment currently bound to `owner`, if any.
    pub fn assigned(&self, owner: u32) -> Option<Lease> {
        self.segments
            .iter()
            .find(|seg| seg.owner() == owner && !seg.is_finished())
            .map(|seg| Lease {
                begin: seg.begin(),
                position: seg.position(),
                end: seg.end(),
                shrunk: None,
            })
    }

    /// Record `n` bytes of confirmed output for the segment owned by `owner`.
    /// Returns the amount accepted (clamped at the segment's `end`).
    pub fn advance(&mut self, owner: u32, n: u64) -> Result<u64, SegmentError> {
        if owner == 0 {
            return Err(SegmentError::InvalidOwner);
        }
        for seg in &mut self.segments {
            if seg.owner() == owner && !seg.is_finished() {
                return seg.advance(n);
            }
        }
        Err(SegmentError::AllFinished)
    }

    /// Find work for a worker slot.
    ///
    /// In order: the slot's own unfinished segment (idempotent), the first
    /// unowned unfinished segment, or a split of the unfinished segment with
    /// the largest remaining window (first among ties) when that window is at
    /// least `2 * min_chunk`. Splits take the upper half, so the donor keeps
    /// its prefix and cursor; the caller must deliver `Shrink::end` to the
    /// donor so it stops early.
    pub fn start(&mut self, owner: u32) -> Result<Start, SegmentError> {
        if owner == 0 {
            return Err(SegmentError::InvalidOwner);
        }
        let mut largest: Option<usize> = None;
        let mut largest_remaining = 0u64;
        for (i, seg) in self.segments.iter_mut().enumerate() {
            if seg.is_finished() {
                continue;
            }
            if seg.owner() == owner {
                return Ok(Start::AlreadyRunning);
            }
            if seg.owner() == 0 {
                seg.start(owner)?;
                return Ok(Start::Assigned(Lease {
                    begin: seg.begin(),
                    position: seg.position(),
                    end: seg.end(),
                    shrunk: None,
                }));
            }
            if seg.remaining() > largest_remaining {
                largest_remaining = seg.remaining();
                largest = Some(i);
            }
        }

        if let Some(i) = largest {
            if largest_remaining >= 2 * self.min_chunk {
                let donor_owner = self.segments[i].owner();
                let mut upper = self.segments[i].split();
                upper.start(owner)?;
                let lease = Lease {
                    begin: upper.begin(),
                    position: upper.position(),
                    end: upper.end(),
                    shrunk: Some(Shrink {
                        owner: donor_owner,
                        end: self.segments[i].end(),
                    }),
                };
                self.segments.push(upper);
                return Ok(Start::Assigned(lease));
            }
        }
        Ok(Start::AllFinished)
    }

    /// Reopen `[begin, end)` as pending coverage (hash audit found it bad).
    /// The fresh segment shadows prior finished coverage until `clean_overlap`
    /// reconciles; a later download session fills it again.
    pub fn remove(&mut self, begin: u64, end: u64) {
        self.segments.push(Segment::new(begin, end));
    }

    /// Sort by `(begin asc, end desc)` and coalesce finished segments that
    /// touch or overlap. Unfinished segments are preserved verbatim.
    pub fn clean_overlap(&mut self) {
        self.segments
            .sort_by(|a, b| a.begin().cmp(&b.begin()).then(b.end().cmp(&a.end())));

        let mut out: Vec<Segment> = Vec::with_capacity(self.segments.len());
        let mut run: Option<Segment> = None;
        for seg in self.segments.drain(..) {
            if !seg.is_finished() {
                out.push(seg);
                continue;
            }
            match run.as_mut() {
                Some(acc) if seg.begin() <= acc.end() => acc.merge(&seg),
                _ => {
                    if let Some(acc) = run.take() {
                        if !acc.is_empty() {
                            out.push(acc);
                        }
                    }
                    run = Some(seg);
                }
            }
        }
        if let Some(acc) = run {
            if !acc.is_empty() {
                out.push(acc);
            }
        }
        out.sort_by(|a, b| a.begin().cmp(&b.begin()).then(b.end().cmp(&a.end())));
        self.segments = out;
    }
}
