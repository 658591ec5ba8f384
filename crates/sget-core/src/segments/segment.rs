//! Single segment: `[begin, end)` plus write cursor and owning worker slot.

use std::fmt;
use std::str::FromStr;

/// Error raised by segment and segment-set operations.
///
/// Kept as a hand-rolled enum (rather than anyhow) so callers can match on
/// the cases that are part of normal control flow (`Finished`, `AllFinished`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    /// A state-file token did not parse as `begin-position-end`.
    WrongFormat(String),
    /// Worker slot id was zero (reserved for "unowned").
    InvalidOwner,
    /// `start` called on a segment that already has an owner.
    AlreadyStarted,
    /// `advance` called on a segment with no owner.
    NotActive,
    /// `advance` called on a segment whose cursor already reached `end`.
    Finished,
    /// No unfinished segment matched the request.
    AllFinished,
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentError::WrongFormat(token) => {
                write!(f, "wrong segment format: {:?} (expected begin-position-end)", token)
            }
            SegmentError::InvalidOwner => write!(f, "invalid worker slot id 0"),
            SegmentError::AlreadyStarted => write!(f, "segment already started"),
            SegmentError::NotActive => write!(f, "segment not active"),
            SegmentError::Finished => write!(f, "segment finished"),
            SegmentError::AllFinished => write!(f, "all segments finished"),
        }
    }
}

impl std::error::Error for SegmentError {}

/// One byte range of the download: `[begin, end)`, half-open.
///
/// `position` is the next byte to be written (`begin <= position <= end`);
/// `owner` is the worker slot currently filling the segment, 0 when unowned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    begin: u64,
    end: u64,
    position: u64,
    owner: u32,
}

impl Segment {
    /// New unowned segment with the cursor at `begin`.
    pub fn new(begin: u64, end: u64) -> Self {
        Segment {
            begin,
            end: end.max(begin),
            position: begin,
            owner: 0,
        }
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Next byte to be written.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Worker slot currently filling this segment, 0 when unowned.
    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes still to be written.
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.position)
    }

    /// Bytes already written.
    pub fn written(&self) -> u64 {
        self.position - self.begin
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.end
    }

    pub fn is_active(&self) -> bool {
        self.owner != 0 && !self.is_finished()
    }

    /// Bind this segment to a worker slot.
    pub fn start(&mut self, owner: u32) -> Result<(), SegmentError> {
        if self.owner != 0 {
            return Err(SegmentError::AlreadyStarted);
        }
        if owner == 0 {
            return Err(SegmentError::InvalidOwner);
        }
        self.owner = owner;
        Ok(())
    }

    /// Advance the cursor by up to `n` bytes of confirmed output and return
    /// the amount actually accepted (clamped to `remaining`).
    pub fn advance(&mut self, n: u64) -> Result<u64, SegmentError> {
        if self.is_finished() {
            return Err(SegmentError::Finished);
        }
        if self.owner == 0 {
            return Err(SegmentError::NotActive);
        }
        let n = n.min(self.remaining());
        self.position += n;
        Ok(n)
    }

    /// Split off the upper half of the untransferred window.
    ///
    /// Truncates this segment to `mid = position + remaining/2` and returns a
    /// new unowned segment `[mid, end)`. Callers must ensure
    /// `remaining >= 2 * min_chunk` first so neither half degenerates.
    pub fn split(&mut self) -> Segment {
        let mid = self.position + self.remaining() / 2;
        let upper = Segment::new(mid, self.end);
        self.end = mid;
        upper
    }

    /// True when the ranges share at least one byte.
    pub fn overlaps(&self, other: &Segment) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// True when the ranges are adjacent with no gap.
    pub fn touches(&self, other: &Segment) -> bool {
        self.begin == other.end || self.end == other.begin
    }

    /// Absorb `other` into the convex hull of both ranges.
    ///
    /// Both segments must be finished and must touch, overlap, or contain one
    /// another; violating that corrupts the ledger, so it is asserted.
    pub fn merge(&mut self, other: &Segment) {
        assert!(
            self.is_finished() && other.is_finished(),
            "cannot merge unfinished segments: {} + {}",
            self,
            other
        );
        assert!(
            self.overlaps(other) || self.touches(other),
            "cannot merge disjoint segments: {} + {}",
            self,
            other
        );
        self.begin = self.begin.min(other.begin);
        self.end = self.end.max(other.end);
        self.position = self.end;
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.begin, self.position, self.end)
    }
}

impl FromStr for Segment {
    type Err = SegmentError;

    /// Parses the state-file form `begin-position-end`, requiring
    /// `begin <= position <= end`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wrong = || SegmentError::WrongFormat(s.to_string());
        let mut parts = s.trim().splitn(3, '-');
        let begin: u64 = parts.next().ok_or_else(wrong)?.trim().parse().map_err(|_| wrong())?;
        let position: u64 = parts.next().ok_or_else(wrong)?.trim().parse().map_err(|_| wrong())?;
        let end: u64 = parts.next().ok_or_else(wrong)?.trim().parse().map_err(|_| wrong())?;
        if begin > position || position > end {
            return Err(wrong());
        }
        Ok(Segment {
            begin,
            end,
            position,
            owner: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() {
        let seg: Segment = "100-150-200".parse().unwrap();
        assert_eq!(seg.begin(), 100);
        assert_eq!(seg.position(), 150);
        assert_eq!(seg.end(), 200);
        assert_eq!(seg.owner(), 0);
        assert_eq!(seg.to_string(), "100-150-200");
    }

    #[test]
    fn parse_tolerates_whitespace() {
        let seg: Segment = " 0-5-9 ".parse().unwrap();
        assert_eq!(seg.to_string(), "0-5-9");
    }

    #[test]
    fn parse_rejects_bad_tokens() {
        assert!(matches!("1-2".parse::<Segment>(), Err(SegmentError::WrongFormat(_))));
        assert!(matches!("a-b-c".parse::<Segment>(), Err(SegmentError::WrongFormat(_))));
        assert!(matches!("".parse::<Segment>(), Err(SegmentError::WrongFormat(_))));
        // cursor outside the range
        assert!(matches!("5-4-9".parse::<Segment>(), Err(SegmentError::WrongFormat(_))));
        assert!(matches!("5-10-9".parse::<Segment>(), Err(SegmentError::WrongFormat(_))));
    }

    #[test]
    fn derived_quantities() {
        let seg: Segment = "100-150-200".parse().unwrap();
        assert_eq!(seg.len(), 100);
        assert_eq!(seg.written(), 50);
        assert_eq!(seg.remaining(), 50);
        assert!(!seg.is_finished());
        assert!(!seg.is_active());
    }

    #[test]
    fn start_binds_owner_once() {
        let mut seg = Segment::new(0, 100);
        assert_eq!(seg.start(0), Err(SegmentError::InvalidOwner));
        seg.start(3).unwrap();
        assert_eq!(seg.owner(), 3);
        assert!(seg.is_active());
        assert_eq!(seg.start(4), Err(SegmentError::AlreadyStarted));
    }

    #[test]
    fn advance_clamps_and_finishes() {
        let mut seg = Segment::new(0, 10);
        assert_eq!(seg.advance(4), Err(SegmentError::NotActive));
        seg.start(1).unwrap();
        assert_eq!(seg.advance(4).unwrap(), 4);
        assert_eq!(seg.position(), 4);
        // more than remaining is clamped
        assert_eq!(seg.advance(100).unwrap(), 6);
        assert!(seg.is_finished());
        assert_eq!(seg.advance(1), Err(SegmentError::Finished));
    }

    #[test]
    fn split_takes_upper_half() {
        let mut seg = Segment::new(0, 1000);
        seg.start(1).unwrap();
        seg.advance(100).unwrap();
        let upper = seg.split();
        // donor keeps its prefix and cursor
        assert_eq!(seg.begin(), 0);
        assert_eq!(seg.position(), 100);
        assert_eq!(seg.end(), 550);
        // new half starts unowned at the midpoint
        assert_eq!(upper.begin(), 550);
        assert_eq!(upper.position(), 550);
        assert_eq!(upper.end(), 1000);
        assert_eq!(upper.owner(), 0);
        assert_eq!(seg.end() + upper.len(), 1000);
    }

    #[test]
    fn merge_joins_touching_finished() {
        let mut a: Segment = "0-100-100".parse().unwrap();
        let b: Segment = "100-200-200".parse().unwrap();
        a.merge(&b);
        assert_eq!(a.to_string(), "0-200-200");
    }

    #[test]
    fn merge_joins_contained_finished() {
        let mut a: Segment = "0-300-300".parse().unwrap();
        let b: Segment = "100-200-200".parse().unwrap();
        a.merge(&b);
        assert_eq!(a.to_string(), "0-300-300");
    }

    #[test]
    #[should_panic(expected = "unfinished")]
    fn merge_rejects_unfinished() {
        let mut a: Segment = "0-50-100".parse().unwrap();
        let b: Segment = "100-200-200".parse().unwrap();
        a.merge(&b);
    }

    #[test]
    #[should_panic(expected = "disjoint")]
    fn merge_rejects_disjoint() {
        let mut a: Segment = "0-100-100".parse().unwrap();
        let b: Segment = "200-300-300".parse().unwrap();
        a.merge(&b);
    }
}
