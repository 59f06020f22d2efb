//! An append-only, sequence-numbered log of buffered operations.
//!
//! Each [Entry] is assigned a `sequence` equal to its position in the [MutationLog]. Sequences are
//! never reused while an entry is retained: truncation discards the suffix, and the next append
//! reuses the first discarded position.
//!
//! # Format
//!
//! Operations are serialized back to back in log order (see [codec]):
//!
//! ```text
//! +------+------------+-------------+-----+---------------+-------+
//! | type | family (v) | key len (v) | key | value len (v) | value |
//! +------+------------+-------------+-----+---------------+-------+
//!
//! (v) = LEB128 varint; family and key are present for keyed operations only.
//! ```

pub mod codec;

use crate::Error;
use bytes::Bytes;
use commonware_utils::hex;
use std::fmt;
use tracing::trace;

/// The kind of an [Op].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpType {
    Put,
    Merge,
    Delete,
    SingleDelete,
    DeleteRange,
    LogData,
    BeginPrepare,
    EndPrepare,
    Commit,
    Rollback,
}

impl OpType {
    /// Returns true if the operation counts as an update of the batch.
    ///
    /// Log data and two-phase-commit markers are carried along but never counted.
    pub fn is_update(&self) -> bool {
        matches!(
            self,
            OpType::Put
                | OpType::Merge
                | OpType::Delete
                | OpType::SingleDelete
                | OpType::DeleteRange
        )
    }
}

/// A buffered operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// Set `key` to `value`.
    Put { family: u32, key: Bytes, value: Bytes },

    /// Fold `value` into the current value of `key` with the merge operator.
    Merge { family: u32, key: Bytes, value: Bytes },

    /// Remove `key`.
    Delete { family: u32, key: Bytes },

    /// Remove `key`, which was produced by exactly one put.
    SingleDelete { family: u32, key: Bytes },

    /// Remove every key in `[begin, end)`.
    DeleteRange { family: u32, begin: Bytes, end: Bytes },

    /// An opaque blob that travels with the batch but is never applied.
    LogData(Bytes),

    BeginPrepare,
    EndPrepare(Bytes),
    Commit(Bytes),
    Rollback(Bytes),
}

impl Op {
    /// The kind of this operation.
    pub fn op_type(&self) -> OpType {
        match self {
            Op::Put { .. } => OpType::Put,
            Op::Merge { .. } => OpType::Merge,
            Op::Delete { .. } => OpType::Delete,
            Op::SingleDelete { .. } => OpType::SingleDelete,
            Op::DeleteRange { .. } => OpType::DeleteRange,
            Op::LogData(_) => OpType::LogData,
            Op::BeginPrepare => OpType::BeginPrepare,
            Op::EndPrepare(_) => OpType::EndPrepare,
            Op::Commit(_) => OpType::Commit,
            Op::Rollback(_) => OpType::Rollback,
        }
    }

    /// If this operation targets a column family, returns its id.
    pub fn family(&self) -> Option<u32> {
        match self {
            Op::Put { family, .. }
            | Op::Merge { family, .. }
            | Op::Delete { family, .. }
            | Op::SingleDelete { family, .. }
            | Op::DeleteRange { family, .. } => Some(*family),
            _ => None,
        }
    }

    /// If this is a point operation, returns its key.
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Op::Put { key, .. }
            | Op::Merge { key, .. }
            | Op::Delete { key, .. }
            | Op::SingleDelete { key, .. } => Some(key),
            _ => None,
        }
    }

    /// If this is a [Op::Put] or [Op::Merge], returns its value.
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            Op::Put { value, .. } | Op::Merge { value, .. } => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Put { family, key, value } => {
                write!(f, "[put cf:{family} key:{} value:{}]", hex(key), hex(value))
            }
            Op::Merge { family, key, value } => write!(
                f,
                "[merge cf:{family} key:{} value:{}]",
                hex(key),
                hex(value)
            ),
            Op::Delete { family, key } => write!(f, "[delete cf:{family} key:{}]", hex(key)),
            Op::SingleDelete { family, key } => {
                write!(f, "[single delete cf:{family} key:{}]", hex(key))
            }
            Op::DeleteRange { family, begin, end } => write!(
                f,
                "[delete range cf:{family} begin:{} end:{}]",
                hex(begin),
                hex(end)
            ),
            Op::LogData(blob) => write!(f, "[log data:{}]", hex(blob)),
            Op::BeginPrepare => write!(f, "[begin prepare]"),
            Op::EndPrepare(xid) => write!(f, "[end prepare xid:{}]", hex(xid)),
            Op::Commit(xid) => write!(f, "[commit xid:{}]", hex(xid)),
            Op::Rollback(xid) => write!(f, "[rollback xid:{}]", hex(xid)),
        }
    }
}

/// An [Op] and the position it was appended at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub sequence: u64,
    pub op: Op,
}

/// An append-only log of [Entry]s.
#[derive(Debug, Default)]
pub struct MutationLog {
    entries: Vec<Entry>,

    // Bumped on every append, truncation, and clear so detached readers can detect that the log
    // changed underneath them.
    generation: u64,
}

impl MutationLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `op` and return its sequence.
    pub fn append(&mut self, op: Op) -> u64 {
        let sequence = self.entries.len() as u64;
        trace!(sequence, %op, "appended op");
        self.entries.push(Entry { sequence, op });
        self.generation += 1;
        sequence
    }

    /// Discard every entry at or past `length`, returning the discarded entries in log order.
    pub fn truncate_to(&mut self, length: usize) -> Result<Vec<Entry>, Error> {
        if length > self.entries.len() {
            return Err(Error::InvalidState("truncate past end of log"));
        }
        let removed = self.entries.split_off(length);
        self.generation += 1;
        trace!(length, removed = removed.len(), "truncated log");
        Ok(removed)
    }

    /// Discard every entry. Sequences restart at zero.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.generation += 1;
    }

    /// The entry with `sequence`, if it has not been truncated away.
    pub fn get(&self, sequence: u64) -> Option<&Entry> {
        usize::try_from(sequence)
            .ok()
            .and_then(|pos| self.entries.get(pos))
    }

    /// The number of entries (and the sequence of the next append).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A counter that changes whenever the log does.
    ///
    /// Two reads returning the same generation saw the same entries.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Entries in log order, as of the current length.
    pub fn forward(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    /// Entries in reverse log order, as of the current length.
    pub fn backward(&self) -> std::iter::Rev<std::slice::Iter<'_, Entry>> {
        self.entries.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    fn put(key: &'static [u8]) -> Op {
        Op::Put {
            family: 0,
            key: Bytes::from_static(key),
            value: Bytes::from_static(b"v"),
        }
    }

    #[test_traced]
    fn test_append_assigns_positions() {
        let mut log = MutationLog::new();
        assert_eq!(log.append(put(b"a")), 0);
        assert_eq!(log.append(Op::LogData(Bytes::from_static(b"blob"))), 1);
        assert_eq!(log.append(put(b"b")), 2);
        assert_eq!(log.len(), 3);
        for (pos, entry) in log.forward().enumerate() {
            assert_eq!(entry.sequence, pos as u64);
            assert_eq!(log.get(entry.sequence), Some(entry));
        }
        assert!(log.get(3).is_none());
    }

    #[test_traced]
    fn test_backward_mirrors_forward() {
        let mut log = MutationLog::new();
        for key in [&b"a"[..], b"b", b"c"] {
            log.append(put(key));
        }
        let forward: Vec<_> = log.forward().map(|e| e.sequence).collect();
        let mut backward: Vec<_> = log.backward().map(|e| e.sequence).collect();
        backward.reverse();
        assert_eq!(forward, backward);

        // A sequence is restartable: asking again yields the same entries.
        assert_eq!(log.forward().count(), 3);
        assert_eq!(log.forward().count(), 3);
    }

    #[test_traced]
    fn test_truncate() {
        let mut log = MutationLog::new();
        log.append(put(b"a"));
        log.append(put(b"b"));
        let generation = log.generation();

        assert!(matches!(log.truncate_to(3), Err(Error::InvalidState(_))));
        assert_eq!(log.generation(), generation);

        let removed = log.truncate_to(1).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].sequence, 1);
        assert_eq!(log.len(), 1);
        assert!(log.generation() > generation);

        // The next append reuses the discarded position.
        assert_eq!(log.append(put(b"c")), 1);
    }

    #[test]
    fn test_op_accessors() {
        let range = Op::DeleteRange {
            family: 3,
            begin: Bytes::from_static(b"a"),
            end: Bytes::from_static(b"z"),
        };
        assert_eq!(range.op_type(), OpType::DeleteRange);
        assert_eq!(range.family(), Some(3));
        assert!(range.key().is_none());
        assert!(range.value().is_none());
        assert!(OpType::DeleteRange.is_update());

        let marker = Op::Commit(Bytes::from_static(b"xid"));
        assert_eq!(marker.family(), None);
        assert!(!marker.op_type().is_update());
        assert!(!OpType::LogData.is_update());
        assert_eq!(format!("{marker}"), "[commit xid:786964]");
    }
}
