//! A write batch that indexes its buffered operations for reading.
//!
//! [IndexedWriteBatch] pairs a [WriteBatch] with a [KeyIndex] kept in lockstep with the batch's
//! log: every recorded operation is indexed as it is appended, and rolling back to a save point
//! repairs the index entries of the discarded suffix.
//!
//! Buffered state can be read back in three ways:
//!
//! - Point lookups ([IndexedWriteBatch::get_from_batch] and
//!   [IndexedWriteBatch::get_from_batch_and_db]).
//! - A batch-only ordered cursor ([WriteBatchIterator]).
//! - A cursor merging the batch over a store's ordered view ([BaseDeltaIterator]).
//!
//! Cursors are detached: they hold no borrow of the batch and receive it on every positioning call.
//! A cursor created before any write to the batch, or handed a batch other than the one it was
//! opened on, fails with [Error::IteratorInvalidated] on its next positioning call.

mod base_delta;
mod iterator;
mod reader;

pub use base_delta::BaseDeltaIterator;
pub use iterator::{WriteBatchIterator, WriteEntry};

use crate::{
    batch::{WriteBatch, WriteBatchBase},
    comparator::{Bytewise, ColumnFamily, Comparator, DEFAULT_FAMILY},
    index::KeyIndex,
    log::{codec, MutationLog, Op},
    merge::MergeOperator,
    store::{BaseIterator, DurableStore, ReadOptions},
    Error,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::debug;

/// Source of [IndexedWriteBatch] identities, unique within the process.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Configuration for [IndexedWriteBatch].
#[derive(Clone)]
pub struct Config {
    /// If true, only the newest operation on each key is visible to [WriteBatchIterator].
    pub overwrite_key: bool,

    /// The ordering of the default column family (and of any family used without a handle).
    pub comparator: Arc<dyn Comparator>,

    /// Folds buffered merge operands in [IndexedWriteBatch::get_from_batch_and_db].
    pub merge_operator: Option<Arc<dyn MergeOperator>>,

    /// Maximum encoded size of the batch in bytes (0 means unlimited).
    pub max_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            overwrite_key: false,
            comparator: Arc::new(Bytewise),
            merge_operator: None,
            max_bytes: 0,
        }
    }
}

/// A [WriteBatch] with an ordered index over its buffered operations.
pub struct IndexedWriteBatch {
    id: u64,
    batch: WriteBatch,
    index: KeyIndex,
    merge_operator: Option<Arc<dyn MergeOperator>>,
}

impl Default for IndexedWriteBatch {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl IndexedWriteBatch {
    /// Create an empty batch. The default column family is ordered by [Config::comparator].
    pub fn new(cfg: Config) -> Self {
        let default_family =
            ColumnFamily::new(DEFAULT_FAMILY, "default", cfg.comparator.clone());
        let mut batch = WriteBatch::new(default_family);
        batch.set_max_bytes(cfg.max_bytes);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            batch,
            index: KeyIndex::new(cfg.overwrite_key, cfg.comparator),
            merge_operator: cfg.merge_operator,
        }
    }

    /// Rebuild an indexed batch from the output of [WriteBatchBase::data].
    ///
    /// `families` are bound before any record is replayed so that their keys are ordered by the
    /// right comparator. Records of any other family are ordered by the default comparator.
    pub fn deserialize(cfg: Config, families: &[ColumnFamily], data: &[u8]) -> Result<Self, Error> {
        let mut batch = Self::new(cfg);
        for family in families {
            batch.register(family)?;
        }
        for op in codec::decode_all(data)? {
            batch.record(None, op)?;
        }
        debug!(
            entries = batch.log().len(),
            keys = batch.index.keys(),
            "deserialized indexed batch"
        );
        Ok(batch)
    }

    /// Bind the comparator of `family` without writing to it.
    pub fn register(&mut self, family: &ColumnFamily) -> Result<(), Error> {
        self.index.bind(family)
    }

    /// The buffered operations, in order.
    pub fn log(&self) -> &MutationLog {
        self.batch.log()
    }

    /// The index over [IndexedWriteBatch::log].
    pub fn index(&self) -> &KeyIndex {
        &self.index
    }

    /// Changes on every write, rollback, and clear.
    pub fn generation(&self) -> u64 {
        self.batch.log().generation()
    }

    /// Identifies this batch and its current state to the cursors opened on it.
    pub(crate) fn stamp(&self) -> (u64, u64) {
        (self.id, self.generation())
    }

    pub fn overwrite_key(&self) -> bool {
        self.index.overwrite_key()
    }

    /// Give up the index, returning the underlying batch.
    pub fn into_batch(self) -> WriteBatch {
        self.batch
    }

    /// Open a batch-only cursor over `family`.
    pub fn iterator(&self, family: &ColumnFamily) -> Result<WriteBatchIterator, Error> {
        self.index.check(family)?;
        Ok(WriteBatchIterator::new(self, family.id()))
    }

    /// Open a cursor over `family` that layers the batch over `store`.
    ///
    /// The store's [ReadOptions::iterate_upper_bound] bounds the store side only.
    pub fn iterator_with_base<'a, S: DurableStore>(
        &self,
        store: &'a S,
        family: &ColumnFamily,
        options: &ReadOptions,
    ) -> Result<BaseDeltaIterator<S::Iterator<'a>>, Error> {
        let base = store.iterator(family, options).map_err(Error::store)?;
        self.iterator_over(family, base)
    }

    /// Open a cursor over `family` that layers the batch over an already opened `base` cursor.
    ///
    /// `base` must be ordered by the comparator of `family`.
    pub fn iterator_over<B: BaseIterator>(
        &self,
        family: &ColumnFamily,
        base: B,
    ) -> Result<BaseDeltaIterator<B>, Error> {
        self.index.check(family)?;
        Ok(BaseDeltaIterator::new(self, family.id(), base))
    }
}

impl WriteBatchBase for IndexedWriteBatch {
    fn default_family(&self) -> &ColumnFamily {
        self.batch.default_family()
    }

    fn batch(&self) -> &WriteBatch {
        &self.batch
    }

    fn record(&mut self, family: Option<&ColumnFamily>, op: Op) -> Result<u64, Error> {
        // A rejected append must not leave a binding behind.
        if let Some(family) = family {
            self.index.check(family)?;
        }
        let sequence = self.batch.append(op)?;
        if let Some(family) = family {
            self.index.bind(family)?;
        }
        if let Some(entry) = self.batch.log().get(sequence) {
            self.index.insert(entry);
        }
        Ok(sequence)
    }

    fn clear(&mut self) {
        self.batch.clear();
        self.index.clear();
    }

    fn set_save_point(&mut self) {
        self.batch.set_save_point();
    }

    fn rollback_to_save_point(&mut self) -> Result<(), Error> {
        let removed = self.batch.rollback()?;
        let length = self.batch.log().len();
        self.index.rebuild_suffix(length, &removed);
        debug!(length, keys = self.index.keys(), "rebuilt index suffix");
        Ok(())
    }

    fn pop_save_point(&mut self) -> Result<(), Error> {
        self.batch.pop_save_point()
    }

    fn set_max_bytes(&mut self, max_bytes: usize) {
        self.batch.set_max_bytes(max_bytes);
    }
}
