//! Save points for partial rollback of a batch.
//!
//! A [SavePoint] records the shape of a batch (log length, update count, encoded size, and
//! [ContentFlags]) at the moment it was set. Save points nest: [SavePointStack] is strictly LIFO.

use crate::{log::OpType, Error};
use std::ops::{BitOr, BitOrAssign};

/// A bitmask of the operation kinds present in a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ContentFlags(u32);

impl ContentFlags {
    pub const EMPTY: Self = Self(0);
    pub const HAS_PUT: Self = Self(1 << 0);
    pub const HAS_DELETE: Self = Self(1 << 1);
    pub const HAS_SINGLE_DELETE: Self = Self(1 << 2);
    pub const HAS_DELETE_RANGE: Self = Self(1 << 3);
    pub const HAS_MERGE: Self = Self(1 << 4);
    pub const HAS_BEGIN_PREPARE: Self = Self(1 << 5);
    pub const HAS_END_PREPARE: Self = Self(1 << 6);
    pub const HAS_COMMIT: Self = Self(1 << 7);
    pub const HAS_ROLLBACK: Self = Self(1 << 8);

    /// The flag set by an operation of type `op` (log data sets none).
    pub fn of(op: OpType) -> Self {
        match op {
            OpType::Put => Self::HAS_PUT,
            OpType::Merge => Self::HAS_MERGE,
            OpType::Delete => Self::HAS_DELETE,
            OpType::SingleDelete => Self::HAS_SINGLE_DELETE,
            OpType::DeleteRange => Self::HAS_DELETE_RANGE,
            OpType::LogData => Self::EMPTY,
            OpType::BeginPrepare => Self::HAS_BEGIN_PREPARE,
            OpType::EndPrepare => Self::HAS_END_PREPARE,
            OpType::Commit => Self::HAS_COMMIT,
            OpType::Rollback => Self::HAS_ROLLBACK,
        }
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for ContentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ContentFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The shape of a batch at a point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SavePoint {
    /// Number of log entries.
    pub size: usize,

    /// Number of updates (see [OpType::is_update]).
    pub count: u32,

    /// Encoded size of the batch in bytes.
    pub data_size: usize,

    pub content_flags: ContentFlags,
}

/// A LIFO stack of [SavePoint]s.
#[derive(Debug, Default)]
pub struct SavePointStack {
    stack: Vec<SavePoint>,
}

impl SavePointStack {
    /// Push `point` as the most recent save point.
    pub fn push(&mut self, point: SavePoint) {
        self.stack.push(point);
    }

    /// Remove and return the most recent save point.
    pub fn pop(&mut self) -> Result<SavePoint, Error> {
        self.stack
            .pop()
            .ok_or(Error::InvalidState("no save point set"))
    }

    /// The most recent save point, if any.
    pub fn top(&self) -> Option<&SavePoint> {
        self.stack.last()
    }

    /// The number of save points set.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Forget every save point.
    pub fn clear(&mut self) {
        self.stack.clear();
    }
}
