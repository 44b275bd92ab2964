//! Event sequence arithmetic and per-origin watermark tracking.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ReplicaId;

/// A sequence position that may be zero (nothing applied yet).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq0(u64);

impl Seq0 {
    pub const ZERO: Seq0 = Seq0(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Seq1 {
        let next = self
            .0
            .checked_add(1)
            .expect("seq0 overflow computing next seq1");
        Seq1(NonZeroU64::new(next).expect("seq1 cannot be zero"))
    }
}

impl fmt::Debug for Seq0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq0({})", self.0)
    }
}

impl fmt::Display for Seq0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Seq0> for u64 {
    fn from(value: Seq0) -> u64 {
        value.0
    }
}

/// A sequence number assigned to an event. Never zero and never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq1(NonZeroU64);

impl Seq1 {
    pub fn from_u64(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    pub fn next(self) -> Seq1 {
        let next = self
            .0
            .get()
            .checked_add(1)
            .expect("seq1 overflow computing next");
        Seq1(NonZeroU64::new(next).expect("seq1 cannot be zero"))
    }

    pub fn prev_seq0(self) -> Seq0 {
        Seq0(self.0.get() - 1)
    }
}

impl fmt::Debug for Seq1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq1({})", self.0)
    }
}

impl fmt::Display for Seq1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Seq1> for u64 {
    fn from(value: Seq1) -> u64 {
        value.0.get()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatermarkError {
    #[error("expected contiguous seq {expected}, got {got}")]
    NonContiguous { expected: Seq1, got: Seq1 },
    #[error("watermark would move backward (have {have}, got {got})")]
    Backward { have: Seq0, got: Seq0 },
}

/// Highest applied sequence per producing replica.
///
/// A watermark never decreases. Contiguous advancement is enforced on the
/// apply path; `observe_at_least` is used when catching up from replay, where
/// the leader vouches for the skipped range.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    inner: BTreeMap<ReplicaId, Seq0>,
}

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, origin: &ReplicaId) -> Seq0 {
        self.inner.get(origin).copied().unwrap_or(Seq0::ZERO)
    }

    /// Advance by exactly one. Rejects gaps and replays.
    pub fn advance_contiguous(
        &mut self,
        origin: &ReplicaId,
        next: Seq1,
    ) -> Result<(), WatermarkError> {
        let expected = self.get(origin).next();
        if next != expected {
            return Err(WatermarkError::NonContiguous {
                expected,
                got: next,
            });
        }
        self.inner.insert(*origin, Seq0::new(next.get()));
        Ok(())
    }

    /// Move forward to `seq` without contiguity, never backward.
    pub fn observe_at_least(&mut self, origin: &ReplicaId, seq: Seq0) {
        let current = self.get(origin);
        if seq > current {
            self.inner.insert(*origin, seq);
        }
    }

    pub fn min(&self) -> Seq0 {
        self.inner.values().copied().min().unwrap_or(Seq0::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn origin() -> ReplicaId {
        ReplicaId::new(Uuid::from_bytes([7u8; 16]))
    }

    #[test]
    fn seq_helpers_work() {
        let seq0 = Seq0::new(0);
        let seq1 = seq0.next();
        assert_eq!(seq1.get(), 1);
        assert_eq!(seq1.prev_seq0().get(), 0);
        assert_eq!(seq1.next().get(), 2);
    }

    #[test]
    fn advance_contiguous_rejects_gaps() {
        let mut marks = Watermarks::new();
        let err = marks
            .advance_contiguous(&origin(), Seq1::from_u64(2).unwrap())
            .unwrap_err();
        assert!(matches!(err, WatermarkError::NonContiguous { .. }));
    }

    #[test]
    fn advance_contiguous_walks_forward() {
        let mut marks = Watermarks::new();
        marks
            .advance_contiguous(&origin(), Seq1::from_u64(1).unwrap())
            .unwrap();
        marks
            .advance_contiguous(&origin(), Seq1::from_u64(2).unwrap())
            .unwrap();
        assert_eq!(marks.get(&origin()).get(), 2);
    }

    #[test]
    fn observe_at_least_never_decreases() {
        let mut marks = Watermarks::new();
        marks.observe_at_least(&origin(), Seq0::new(12));
        marks.observe_at_least(&origin(), Seq0::new(5));
        assert_eq!(marks.get(&origin()).get(), 12);
    }
}
