//! Capabilities a batch consumes from the store it is layered over.
//!
//! The batch never holds on to a store. Callers pass one in at call time (see
//! [crate::IndexedWriteBatch::get_from_batch_and_db] and
//! [crate::IndexedWriteBatch::iterator_with_base]).

use crate::comparator::ColumnFamily;
use bytes::Bytes;

/// Options for a single read against a [DurableStore].
#[derive(Clone, Debug, Default)]
pub struct ReadOptions {
    /// If set, store iterators stop before the first key at or past this bound.
    ///
    /// The bound applies to the store side only: keys buffered in a batch are returned regardless.
    pub iterate_upper_bound: Option<Bytes>,
}

/// An ordered, bidirectional cursor over the committed contents of a column family.
///
/// The cursor is either positioned at an entry (`valid` is true) or not. A fault during iteration
/// leaves the cursor invalid and is reported by `status`.
pub trait BaseIterator {
    type Error: std::error::Error + Send + Sync + 'static;

    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);

    /// Position at the first key at or past `key`.
    fn seek(&mut self, key: &[u8]);

    /// Position at the last key at or before `key`.
    fn seek_for_prev(&mut self, key: &[u8]);

    fn next(&mut self);
    fn prev(&mut self);

    /// The current key. Only meaningful while `valid`.
    fn key(&self) -> &[u8];

    /// The current value. Only meaningful while `valid`.
    fn value(&self) -> &[u8];

    fn status(&self) -> Result<(), Self::Error>;
}

/// The authoritative, committed state a batch is read against.
pub trait DurableStore {
    type Error: std::error::Error + Send + Sync + 'static;
    type Iterator<'a>: BaseIterator
    where
        Self: 'a;

    /// Read the committed value of `key` in `family`.
    fn get(
        &self,
        family: &ColumnFamily,
        key: &[u8],
        options: &ReadOptions,
    ) -> Result<Option<Bytes>, Self::Error>;

    /// Open an ordered cursor over `family`.
    fn iterator<'a>(
        &'a self,
        family: &ColumnFamily,
        options: &ReadOptions,
    ) -> Result<Self::Iterator<'a>, Self::Error>;
}
