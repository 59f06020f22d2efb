//! A batch-only ordered cursor over the buffered operations of one column family.

use super::IndexedWriteBatch;
use crate::{
    comparator::{ColumnFamily, Comparator},
    log::{Op, OpType},
    Error,
};
use bytes::Bytes;
use std::{cmp::Ordering, ops::ControlFlow, sync::Arc};
use tracing::debug;

/// A buffered operation as seen by a [WriteBatchIterator].
///
/// Range deletes are keyed at their start, with the (exclusive) end of the range as the value.
/// Deletes and single deletes have an empty value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteEntry {
    pub kind: OpType,
    pub key: Bytes,
    pub value: Bytes,
    pub sequence: u64,
}

/// A position in the cursor's order: by key, then by sequence.
#[derive(Clone, Debug)]
struct Position {
    key: Bytes,
    sequence: u64,
}

/// An ordered cursor over every visible point operation and range delete buffered for one family.
///
/// Entries are ordered by key (with the family's comparator) and then by sequence. Under
/// `overwrite_key` only the newest operation on each key is visible. Log data and
/// two-phase-commit markers are never returned.
///
/// The cursor holds no borrow of the batch. Every positioning call takes the batch, and fails with
/// [Error::IteratorInvalidated] if the batch changed since the cursor was opened or is not the
/// batch it was opened on.
pub struct WriteBatchIterator {
    family: u32,
    comparator: Arc<dyn Comparator>,
    stamp: (u64, u64),
    current: Option<WriteEntry>,
    invalidated: bool,
}

impl WriteBatchIterator {
    pub(super) fn new(batch: &IndexedWriteBatch, family: u32) -> Self {
        Self {
            family,
            comparator: batch.index.comparator(family).clone(),
            stamp: batch.stamp(),
            current: None,
            invalidated: false,
        }
    }

    fn compare(&self, a: &Position, b: &Position) -> Ordering {
        self.comparator
            .compare(&a.key, &b.key)
            .then(a.sequence.cmp(&b.sequence))
    }

    /// Pick the smaller (or, if `largest`, the larger) of two candidate positions.
    fn pick(&self, a: Option<Position>, b: Option<Position>, largest: bool) -> Option<Position> {
        match (a, b) {
            (Some(a), Some(b)) => {
                let a_first = match self.compare(&a, &b) {
                    Ordering::Greater => largest,
                    _ => !largest,
                };
                Some(if a_first { a } else { b })
            }
            (a, b) => a.or(b),
        }
    }

    fn check(&mut self, batch: &IndexedWriteBatch) -> Result<(), Error> {
        if self.invalidated || batch.stamp() != self.stamp {
            if !self.invalidated {
                debug!(family = self.family, "write batch iterator invalidated");
            }
            self.invalidated = true;
            self.current = None;
            return Err(Error::IteratorInvalidated);
        }
        Ok(())
    }

    /// The first point position strictly past `from` (or the first overall).
    fn point_after(&self, batch: &IndexedWriteBatch, from: Option<&Position>) -> Option<Position> {
        let index = &batch.index;
        let Some(from) = from else {
            let (key, refs) = index.first(self.family)?;
            return Some(Position {
                key: key.bytes().clone(),
                sequence: *index.visible(refs).first()?,
            });
        };
        let (key, refs) = index.seek(self.family, &from.key)?;
        if self.comparator.compare(key.bytes(), &from.key).is_eq() {
            if let Some(sequence) = index.visible(refs).iter().find(|s| **s > from.sequence) {
                return Some(Position {
                    key: key.bytes().clone(),
                    sequence: *sequence,
                });
            }
            let (key, refs) = index.after(self.family, key)?;
            return Some(Position {
                key: key.bytes().clone(),
                sequence: *index.visible(refs).first()?,
            });
        }
        Some(Position {
            key: key.bytes().clone(),
            sequence: *index.visible(refs).first()?,
        })
    }

    /// The last point position strictly before `from` (or the last overall).
    fn point_before(&self, batch: &IndexedWriteBatch, from: Option<&Position>) -> Option<Position> {
        let index = &batch.index;
        let Some(from) = from else {
            let (key, refs) = index.last(self.family)?;
            return Some(Position {
                key: key.bytes().clone(),
                sequence: *index.visible(refs).last()?,
            });
        };
        let (key, refs) = index.seek_for_prev(self.family, &from.key)?;
        if self.comparator.compare(key.bytes(), &from.key).is_eq() {
            if let Some(sequence) = index
                .visible(refs)
                .iter()
                .rev()
                .find(|s| **s < from.sequence)
            {
                return Some(Position {
                    key: key.bytes().clone(),
                    sequence: *sequence,
                });
            }
            let (key, refs) = index.before(self.family, key)?;
            return Some(Position {
                key: key.bytes().clone(),
                sequence: *index.visible(refs).last()?,
            });
        }
        Some(Position {
            key: key.bytes().clone(),
            sequence: *index.visible(refs).last()?,
        })
    }

    /// The first range delete position past `from` (or the last one before it, if `backward`).
    fn range_near(
        &self,
        batch: &IndexedWriteBatch,
        from: Option<&Position>,
        backward: bool,
    ) -> Option<Position> {
        batch
            .index
            .range_tombstones(self.family)
            .iter()
            .map(|range| Position {
                key: range.begin.clone(),
                sequence: range.sequence,
            })
            .filter(|candidate| match from {
                None => true,
                Some(from) if backward => self.compare(candidate, from).is_lt(),
                Some(from) => self.compare(candidate, from).is_gt(),
            })
            .fold(None, |best, candidate| {
                self.pick(best, Some(candidate), backward)
            })
    }

    fn materialize(&mut self, batch: &IndexedWriteBatch, position: Option<Position>) {
        self.current = position.and_then(|position| {
            let entry = batch.log().get(position.sequence)?;
            let value = match &entry.op {
                Op::Put { value, .. } | Op::Merge { value, .. } => value.clone(),
                Op::DeleteRange { end, .. } => end.clone(),
                _ => Bytes::new(),
            };
            Some(WriteEntry {
                kind: entry.op.op_type(),
                key: position.key,
                value,
                sequence: position.sequence,
            })
        });
    }

    fn forward_from(&mut self, batch: &IndexedWriteBatch, from: Option<Position>) {
        let point = self.point_after(batch, from.as_ref());
        let range = self.range_near(batch, from.as_ref(), false);
        let next = self.pick(point, range, false);
        self.materialize(batch, next);
    }

    fn backward_from(&mut self, batch: &IndexedWriteBatch, from: Option<Position>) {
        let point = self.point_before(batch, from.as_ref());
        let range = self.range_near(batch, from.as_ref(), true);
        let prev = self.pick(point, range, true);
        self.materialize(batch, prev);
    }

    /// Position at the first entry.
    pub fn seek_to_first(&mut self, batch: &IndexedWriteBatch) -> Result<(), Error> {
        self.check(batch)?;
        self.forward_from(batch, None);
        Ok(())
    }

    /// Position at the last entry.
    pub fn seek_to_last(&mut self, batch: &IndexedWriteBatch) -> Result<(), Error> {
        self.check(batch)?;
        self.backward_from(batch, None);
        Ok(())
    }

    /// Position at the first entry whose key is at or past `key`.
    pub fn seek(&mut self, batch: &IndexedWriteBatch, key: &[u8]) -> Result<(), Error> {
        self.check(batch)?;
        let point = batch.index.seek(self.family, key).and_then(|(k, refs)| {
            Some(Position {
                key: k.bytes().clone(),
                sequence: *batch.index.visible(refs).first()?,
            })
        });
        let range = batch
            .index
            .range_tombstones(self.family)
            .iter()
            .filter(|range| self.comparator.compare(&range.begin, key).is_ge())
            .map(|range| Position {
                key: range.begin.clone(),
                sequence: range.sequence,
            })
            .fold(None, |best, c| self.pick(best, Some(c), false));
        let next = self.pick(point, range, false);
        self.materialize(batch, next);
        Ok(())
    }

    /// Position at the last entry whose key is at or before `key`.
    pub fn seek_for_prev(&mut self, batch: &IndexedWriteBatch, key: &[u8]) -> Result<(), Error> {
        self.check(batch)?;
        let from = Position {
            key: Bytes::copy_from_slice(key),
            sequence: u64::MAX,
        };
        let point = batch
            .index
            .seek_for_prev(self.family, key)
            .and_then(|(k, refs)| {
                Some(Position {
                    key: k.bytes().clone(),
                    sequence: *batch.index.visible(refs).last()?,
                })
            });
        let range = self.range_near(batch, Some(&from), true);
        let prev = self.pick(point, range, true);
        self.materialize(batch, prev);
        Ok(())
    }

    /// Step to the following entry. Fails if the cursor is not positioned.
    pub fn next(&mut self, batch: &IndexedWriteBatch) -> Result<(), Error> {
        self.check(batch)?;
        let Some(current) = self.current.take() else {
            return Err(Error::InvalidState("iterator not positioned"));
        };
        let from = Position {
            key: current.key,
            sequence: current.sequence,
        };
        self.forward_from(batch, Some(from));
        Ok(())
    }

    /// Step to the preceding entry. Fails if the cursor is not positioned.
    pub fn prev(&mut self, batch: &IndexedWriteBatch) -> Result<(), Error> {
        self.check(batch)?;
        let Some(current) = self.current.take() else {
            return Err(Error::InvalidState("iterator not positioned"));
        };
        let from = Position {
            key: current.key,
            sequence: current.sequence,
        };
        self.backward_from(batch, Some(from));
        Ok(())
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// The entry the cursor is positioned at.
    pub fn entry(&self) -> Option<&WriteEntry> {
        self.current.as_ref()
    }

    /// Reports why the cursor stopped being usable, if it did.
    pub fn status(&self) -> Result<(), Error> {
        if self.invalidated {
            return Err(Error::IteratorInvalidated);
        }
        Ok(())
    }
}

impl IndexedWriteBatch {
    /// Visit every entry of `family` in cursor order until `visitor` breaks.
    pub fn enumerate<B>(
        &self,
        family: &ColumnFamily,
        mut visitor: impl FnMut(&WriteEntry) -> ControlFlow<B>,
    ) -> Result<ControlFlow<B>, Error> {
        let mut iter = self.iterator(family)?;
        iter.seek_to_first(self)?;
        while let Some(entry) = iter.entry() {
            if let ControlFlow::Break(b) = visitor(entry) {
                return Ok(ControlFlow::Break(b));
            }
            iter.next(self)?;
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Visit every entry of `family` in reverse cursor order until `visitor` breaks.
    pub fn reverse_enumerate<B>(
        &self,
        family: &ColumnFamily,
        mut visitor: impl FnMut(&WriteEntry) -> ControlFlow<B>,
    ) -> Result<ControlFlow<B>, Error> {
        let mut iter = self.iterator(family)?;
        iter.seek_to_last(self)?;
        while let Some(entry) = iter.entry() {
            if let ControlFlow::Break(b) = visitor(entry) {
                return Ok(ControlFlow::Break(b));
            }
            iter.prev(self)?;
        }
        Ok(ControlFlow::Continue(()))
    }
}
