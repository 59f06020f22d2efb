//! A cursor that layers the buffered operations of a batch over a store's ordered view.

use super::IndexedWriteBatch;
use crate::{
    comparator::{Comparator, OrderedKey},
    index::Slot,
    log::Op,
    store::BaseIterator,
    Error,
};
use bytes::Bytes;
use std::{cmp::Ordering, sync::Arc};
use tracing::debug;

/// The entry a [BaseDeltaIterator] is positioned at.
struct Current {
    key: Bytes,
    value: Bytes,

    // Set if the entry comes from the batch.
    from_delta: bool,

    // Set if the batch entry shadows a base entry with the same key.
    shadows_base: bool,

    pending_merge: bool,
}

/// Which side supplies the next entry.
enum Side {
    Base,
    Delta { shadows_base: bool },
}

/// The newest reference of a key of the index, as the batch side's position.
fn delta_at(slot: Option<Slot<'_>>) -> Option<(OrderedKey, u64)> {
    let (key, refs) = slot?;
    Some((key.clone(), *refs.last()?))
}

/// A merged, ordered view of a batch and a base cursor over the same column family.
///
/// Where both sides hold a key, the batch wins: a buffered put replaces the base value and a
/// buffered delete (or a range delete newer than the key's buffered operations) hides it. Base keys
/// covered by a buffered range delete are skipped.
///
/// A key whose newest buffered operation is a merge is returned as a pending merge (see
/// [BaseDeltaIterator::is_pending_merge]) with the newest operand as its value. Merges are not
/// resolved by the cursor.
///
/// The cursor holds no borrow of the batch. Every positioning call takes the batch, and fails with
/// [Error::IteratorInvalidated] if the batch changed since the cursor was opened or is not the
/// batch it was opened on.
pub struct BaseDeltaIterator<B: BaseIterator> {
    family: u32,
    comparator: Arc<dyn Comparator>,
    stamp: (u64, u64),
    base: B,
    delta: Option<(OrderedKey, u64)>,
    forward: bool,
    current: Option<Current>,
    invalidated: bool,
}

impl<B: BaseIterator> BaseDeltaIterator<B> {
    pub(super) fn new(batch: &IndexedWriteBatch, family: u32, base: B) -> Self {
        Self {
            family,
            comparator: batch.index.comparator(family).clone(),
            stamp: batch.stamp(),
            base,
            delta: None,
            forward: true,
            current: None,
            invalidated: false,
        }
    }

    fn check(&mut self, batch: &IndexedWriteBatch) -> Result<(), Error> {
        if self.invalidated || batch.stamp() != self.stamp {
            if !self.invalidated {
                debug!(family = self.family, "base delta iterator invalidated");
            }
            self.invalidated = true;
            self.current = None;
            return Err(Error::IteratorInvalidated);
        }
        Ok(())
    }

    fn advance_base(&mut self) {
        if self.forward {
            self.base.next();
        } else {
            self.base.prev();
        }
    }

    fn advance_delta(&mut self, batch: &IndexedWriteBatch) {
        let Some((key, _)) = self.delta.take() else {
            return;
        };
        self.delta = if self.forward {
            delta_at(batch.index.after(self.family, &key))
        } else {
            delta_at(batch.index.before(self.family, &key))
        };
    }

    /// The value of the batch side at `key`, or `None` if the batch deletes it.
    fn resolve_delta(
        &self,
        batch: &IndexedWriteBatch,
        key: &[u8],
        sequence: u64,
    ) -> Option<(Bytes, bool)> {
        if batch
            .index
            .covering_tombstone(self.family, key)
            .is_some_and(|range| range > sequence)
        {
            return None;
        }
        match &batch.log().get(sequence)?.op {
            Op::Put { value, .. } => Some((value.clone(), false)),
            Op::Merge { value, .. } => Some((value.clone(), true)),
            _ => None,
        }
    }

    /// Skip deleted entries on both sides until an entry to return is found (or both sides end).
    fn settle(&mut self, batch: &IndexedWriteBatch) -> Result<(), Error> {
        self.current = None;
        loop {
            if !self.base.valid() {
                self.base.status().map_err(Error::store)?;
            }
            let side = match (&self.delta, self.base.valid()) {
                (None, false) => return Ok(()),
                (Some(_), false) => Side::Delta {
                    shadows_base: false,
                },
                (None, true) => Side::Base,
                (Some((key, _)), true) => {
                    let order = self.comparator.compare(key.bytes(), self.base.key());
                    let order = if self.forward {
                        order
                    } else {
                        order.reverse()
                    };
                    match order {
                        Ordering::Less => Side::Delta {
                            shadows_base: false,
                        },
                        Ordering::Equal => Side::Delta { shadows_base: true },
                        Ordering::Greater => Side::Base,
                    }
                }
            };

            match side {
                Side::Base => {
                    let key = self.base.key();
                    if batch.index.covering_tombstone(self.family, key).is_some() {
                        self.advance_base();
                        continue;
                    }
                    self.current = Some(Current {
                        key: Bytes::copy_from_slice(key),
                        value: Bytes::copy_from_slice(self.base.value()),
                        from_delta: false,
                        shadows_base: false,
                        pending_merge: false,
                    });
                    return Ok(());
                }
                Side::Delta { shadows_base } => {
                    let Some((key, sequence)) = self.delta.clone() else {
                        return Ok(());
                    };
                    let Some((value, pending_merge)) =
                        self.resolve_delta(batch, key.bytes(), sequence)
                    else {
                        if shadows_base {
                            self.advance_base();
                        }
                        self.advance_delta(batch);
                        continue;
                    };
                    self.current = Some(Current {
                        key: key.bytes().clone(),
                        value,
                        from_delta: true,
                        shadows_base,
                        pending_merge,
                    });
                    return Ok(());
                }
            }
        }
    }

    /// Reposition both sides around `key` for iteration in the other direction, stepping past
    /// `key` itself.
    fn turn(&mut self, batch: &IndexedWriteBatch, key: &[u8]) {
        self.forward = !self.forward;
        if self.forward {
            self.base.seek(key);
            self.delta = delta_at(batch.index.seek(self.family, key));
        } else {
            self.base.seek_for_prev(key);
            self.delta = delta_at(batch.index.seek_for_prev(self.family, key));
        }
        if self.base.valid() && self.comparator.compare(self.base.key(), key).is_eq() {
            self.advance_base();
        }
        if matches!(&self.delta, Some((d, _)) if self.comparator.compare(d.bytes(), key).is_eq()) {
            self.advance_delta(batch);
        }
    }

    fn step(&mut self, batch: &IndexedWriteBatch, forward: bool) -> Result<(), Error> {
        self.check(batch)?;
        let Some(current) = self.current.take() else {
            return Err(Error::InvalidState("iterator not positioned"));
        };
        if self.forward != forward {
            self.turn(batch, &current.key);
        } else if current.from_delta {
            if current.shadows_base {
                self.advance_base();
            }
            self.advance_delta(batch);
        } else {
            self.advance_base();
        }
        self.settle(batch)
    }

    /// Position at the first entry.
    pub fn seek_to_first(&mut self, batch: &IndexedWriteBatch) -> Result<(), Error> {
        self.check(batch)?;
        self.forward = true;
        self.base.seek_to_first();
        self.delta = delta_at(batch.index.first(self.family));
        self.settle(batch)
    }

    /// Position at the last entry.
    pub fn seek_to_last(&mut self, batch: &IndexedWriteBatch) -> Result<(), Error> {
        self.check(batch)?;
        self.forward = false;
        self.base.seek_to_last();
        self.delta = delta_at(batch.index.last(self.family));
        self.settle(batch)
    }

    /// Position at the first key at or past `key`.
    pub fn seek(&mut self, batch: &IndexedWriteBatch, key: &[u8]) -> Result<(), Error> {
        self.check(batch)?;
        self.forward = true;
        self.base.seek(key);
        self.delta = delta_at(batch.index.seek(self.family, key));
        self.settle(batch)
    }

    /// Position at the last key at or before `key`.
    pub fn seek_for_prev(&mut self, batch: &IndexedWriteBatch, key: &[u8]) -> Result<(), Error> {
        self.check(batch)?;
        self.forward = false;
        self.base.seek_for_prev(key);
        self.delta = delta_at(batch.index.seek_for_prev(self.family, key));
        self.settle(batch)
    }

    /// Step to the following entry. Fails if the cursor is not positioned.
    pub fn next(&mut self, batch: &IndexedWriteBatch) -> Result<(), Error> {
        self.step(batch, true)
    }

    /// Step to the preceding entry. Fails if the cursor is not positioned.
    pub fn prev(&mut self, batch: &IndexedWriteBatch) -> Result<(), Error> {
        self.step(batch, false)
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// The key at the current position.
    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|c| c.key.as_ref())
    }

    /// The value at the current position (the newest operand for a pending merge).
    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|c| c.value.as_ref())
    }

    /// Returns true if the current entry is an unresolved buffered merge.
    pub fn is_pending_merge(&self) -> bool {
        self.current.as_ref().is_some_and(|c| c.pending_merge)
    }

    /// Reports invalidation by a write to the batch, or a fault of the base cursor.
    pub fn status(&self) -> Result<(), Error> {
        if self.invalidated {
            return Err(Error::IteratorInvalidated);
        }
        self.base.status().map_err(Error::store)
    }
}
