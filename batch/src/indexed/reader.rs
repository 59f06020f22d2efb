//! Point lookups against an [IndexedWriteBatch], alone or layered over a store.

use super::IndexedWriteBatch;
use crate::{
    comparator::ColumnFamily,
    log::Op,
    store::{DurableStore, ReadOptions},
    Error,
};
use bytes::Bytes;
use tracing::trace;

/// What the batch knows about the value underneath a run of merge operands.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Base {
    /// A buffered put.
    Value(Bytes),

    /// A buffered delete, single delete, or covering range delete.
    Deleted,

    /// Nothing buffered: the base lives in the store (if anywhere).
    Unknown,
}

/// The state of a key as buffered in a batch.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    Found(Bytes),
    Deleted,

    /// The batch holds nothing for the key.
    Absent,

    /// The newest operations on the key are merges, given oldest first.
    Merge { base: Base, operands: Vec<Bytes> },
}

impl IndexedWriteBatch {
    /// Walk the buffered history of `key` from newest to oldest.
    ///
    /// The walk stops at the first put, delete, or single delete, or at the first entry older than
    /// the newest range delete covering `key`. Merge operands seen on the way are collected.
    pub(crate) fn resolve(&self, family: u32, key: &[u8]) -> Resolution {
        let covering = self.index.covering_tombstone(family, key);
        let mut operands = Vec::new();
        let mut base = None;
        for sequence in self.index.lookup_chain(family, key) {
            if covering.is_some_and(|range| range > sequence) {
                base = Some(Base::Deleted);
                break;
            }
            let Some(entry) = self.log().get(sequence) else {
                continue;
            };
            match &entry.op {
                Op::Put { value, .. } => {
                    base = Some(Base::Value(value.clone()));
                    break;
                }
                Op::Delete { .. } | Op::SingleDelete { .. } => {
                    base = Some(Base::Deleted);
                    break;
                }
                Op::Merge { value, .. } => operands.push(value.clone()),
                _ => {}
            }
        }
        let base = base.unwrap_or(match covering {
            Some(_) => Base::Deleted,
            None => Base::Unknown,
        });

        if operands.is_empty() {
            return match base {
                Base::Value(value) => Resolution::Found(value),
                Base::Deleted => Resolution::Deleted,
                Base::Unknown => Resolution::Absent,
            };
        }
        operands.reverse();
        Resolution::Merge { base, operands }
    }

    /// Read `key` from the batch alone.
    ///
    /// Fails with [Error::KeyNotFound] if the key is deleted in the batch or not buffered at all,
    /// and with [Error::MergeInProgress] if its newest operations are merges (which can only be
    /// resolved against the store).
    pub fn get_from_batch(&self, family: &ColumnFamily, key: &[u8]) -> Result<Bytes, Error> {
        self.index.check(family)?;
        match self.resolve(family.id(), key) {
            Resolution::Found(value) => Ok(value),
            Resolution::Deleted | Resolution::Absent => Err(Error::KeyNotFound),
            Resolution::Merge { .. } => Err(Error::MergeInProgress),
        }
    }

    /// Read `key` from the batch layered over `store`.
    ///
    /// Buffered merge operands are folded, oldest first, onto the newest buffered put or delete of
    /// the key or, if there is none, onto the value read from `store`. The store is read at most
    /// once, and only if the batch does not determine the result on its own.
    pub fn get_from_batch_and_db<S: DurableStore>(
        &self,
        store: &S,
        family: &ColumnFamily,
        key: &[u8],
        options: &ReadOptions,
    ) -> Result<Bytes, Error> {
        self.index.check(family)?;
        let (base, operands) = match self.resolve(family.id(), key) {
            Resolution::Found(value) => return Ok(value),
            Resolution::Deleted => return Err(Error::KeyNotFound),
            Resolution::Absent => {
                return store
                    .get(family, key, options)
                    .map_err(Error::store)?
                    .ok_or(Error::KeyNotFound);
            }
            Resolution::Merge { base, operands } => (base, operands),
        };

        let operator = self
            .merge_operator
            .as_ref()
            .ok_or(Error::MergeOperatorMissing)?;
        let existing = match base {
            Base::Value(value) => Some(value),
            Base::Deleted => None,
            Base::Unknown => store.get(family, key, options).map_err(Error::store)?,
        };
        let merged = operator.full_merge(key, existing.as_deref(), &operands)?;
        trace!(
            family = family.id(),
            operands = operands.len(),
            operator = operator.name(),
            "resolved merge"
        );
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::WriteBatchBase,
        indexed::Config,
        mem::MemStore,
        merge::{MergeError, MergeOperator, StringAppend},
    };
    use commonware_macros::test_traced;
    use std::{
        cell::Cell,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use test_case::test_case;

    /// Sums decimal operands like "+1" onto a decimal base.
    struct Sum;

    impl MergeOperator for Sum {
        fn name(&self) -> &str {
            "sum"
        }

        fn full_merge(
            &self,
            _: &[u8],
            existing: Option<&[u8]>,
            operands: &[Bytes],
        ) -> Result<Bytes, MergeError> {
            let parse = |raw: &[u8]| -> Result<i64, MergeError> {
                std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| MergeError::new("sum", "not a number"))
            };
            let mut total = existing.map(parse).transpose()?.unwrap_or(0);
            for operand in operands {
                total += parse(operand)?;
            }
            Ok(Bytes::from(total.to_string()))
        }
    }

    /// A store that counts reads and serves a fixed value.
    struct Counting {
        value: Option<Bytes>,
        reads: AtomicUsize,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("unreachable")]
    struct Unreachable;

    impl DurableStore for Counting {
        type Error = Unreachable;
        type Iterator<'a> = <MemStore as DurableStore>::Iterator<'a>;

        fn get(
            &self,
            _: &ColumnFamily,
            _: &[u8],
            _: &ReadOptions,
        ) -> Result<Option<Bytes>, Self::Error> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            Ok(self.value.clone())
        }

        fn iterator<'a>(
            &'a self,
            _: &ColumnFamily,
            _: &ReadOptions,
        ) -> Result<Self::Iterator<'a>, Self::Error> {
            Err(Unreachable)
        }
    }

    /// A store whose reads always fail.
    struct Failing {
        attempted: Cell<bool>,
    }

    impl DurableStore for Failing {
        type Error = Unreachable;
        type Iterator<'a> = <MemStore as DurableStore>::Iterator<'a>;

        fn get(
            &self,
            _: &ColumnFamily,
            _: &[u8],
            _: &ReadOptions,
        ) -> Result<Option<Bytes>, Self::Error> {
            self.attempted.set(true);
            Err(Unreachable)
        }

        fn iterator<'a>(
            &'a self,
            _: &ColumnFamily,
            _: &ReadOptions,
        ) -> Result<Self::Iterator<'a>, Self::Error> {
            Err(Unreachable)
        }
    }

    fn counting(value: Option<&'static [u8]>) -> Counting {
        Counting {
            value: value.map(Bytes::from_static),
            reads: AtomicUsize::new(0),
        }
    }

    /// Read `key` of the default family through `batch` into `store`.
    fn read<S: DurableStore>(batch: &IndexedWriteBatch, store: &S, key: &[u8]) -> Bytes {
        let family = ColumnFamily::default();
        let options = ReadOptions::default();
        batch
            .get_from_batch_and_db(store, &family, key, &options)
            .unwrap()
    }

    fn summing() -> IndexedWriteBatch {
        IndexedWriteBatch::new(Config {
            merge_operator: Some(Arc::new(Sum)),
            ..Default::default()
        })
    }

    #[test_traced]
    fn test_get_from_batch() {
        let family = ColumnFamily::default();
        let mut batch = IndexedWriteBatch::default();
        batch.put(b"k1", b"v1").unwrap();
        batch.put(b"k2", b"v2").unwrap();
        batch.put(b"k1", b"v1-new").unwrap();
        batch.delete(b"k2").unwrap();
        batch.single_delete(b"k3").unwrap();

        assert_eq!(
            batch.get_from_batch(&family, b"k1").unwrap(),
            &b"v1-new"[..]
        );
        assert!(matches!(
            batch.get_from_batch(&family, b"k2"),
            Err(Error::KeyNotFound)
        ));
        assert!(matches!(
            batch.get_from_batch(&family, b"k3"),
            Err(Error::KeyNotFound)
        ));
        assert!(matches!(
            batch.get_from_batch(&family, b"missing"),
            Err(Error::KeyNotFound)
        ));

        // A put after a delete makes the key visible again.
        batch.put(b"k2", b"back").unwrap();
        assert_eq!(batch.get_from_batch(&family, b"k2").unwrap(), &b"back"[..]);
    }

    #[test_traced]
    fn test_get_from_batch_merge_in_progress() {
        let family = ColumnFamily::default();
        let mut batch = summing();
        batch.merge(b"k", b"+1").unwrap();
        assert!(matches!(
            batch.get_from_batch(&family, b"k"),
            Err(Error::MergeInProgress)
        ));

        // Even over a buffered put, the operator is not consulted.
        batch.put(b"j", b"1").unwrap();
        batch.merge(b"j", b"+1").unwrap();
        assert!(matches!(
            batch.get_from_batch(&family, b"j"),
            Err(Error::MergeInProgress)
        ));

        // A newer put ends the merge run.
        batch.put(b"j", b"5").unwrap();
        assert_eq!(batch.get_from_batch(&family, b"j").unwrap(), &b"5"[..]);
    }

    #[test_traced]
    fn test_merge_twice_over_empty_store() {
        let store = MemStore::default();
        let family = store.default_family().clone();
        let mut batch = summing();
        batch.merge(b"k", b"+1").unwrap();
        batch.merge(b"k", b"+1").unwrap();
        let value = batch
            .get_from_batch_and_db(&store, &family, b"k", &ReadOptions::default())
            .unwrap();
        assert_eq!(value, &b"2"[..]);
    }

    #[test_case(false; "keep all")]
    #[test_case(true; "overwrite")]
    fn test_merge_operands_in_log_order(overwrite_key: bool) {
        let family = ColumnFamily::default();
        let store = counting(Some(b"base"));
        let mut batch = IndexedWriteBatch::new(Config {
            overwrite_key,
            merge_operator: Some(Arc::new(StringAppend::default())),
            ..Default::default()
        });
        batch.merge(b"k", b"a").unwrap();
        batch.merge(b"k", b"b").unwrap();
        batch.merge(b"k", b"c").unwrap();
        let value = batch
            .get_from_batch_and_db(&store, &family, b"k", &ReadOptions::default())
            .unwrap();
        assert_eq!(value, &b"base,a,b,c"[..]);
        assert_eq!(store.reads.load(Ordering::Relaxed), 1);
    }

    #[test_case(false; "keep all")]
    #[test_case(true; "overwrite")]
    fn test_merge_over_buffered_put_skips_store(overwrite_key: bool) {
        let family = ColumnFamily::default();
        let store = counting(Some(b"stored"));
        let mut batch = IndexedWriteBatch::new(Config {
            overwrite_key,
            merge_operator: Some(Arc::new(Sum)),
            ..Default::default()
        });
        batch.merge(b"k", b"100").unwrap();
        batch.put(b"k", b"10").unwrap();
        batch.merge(b"k", b"+1").unwrap();
        batch.merge(b"k", b"+2").unwrap();
        let value = batch
            .get_from_batch_and_db(&store, &family, b"k", &ReadOptions::default())
            .unwrap();
        assert_eq!(value, &b"13"[..]);

        // A buffered delete is an empty base.
        batch.delete(b"k").unwrap();
        batch.merge(b"k", b"+7").unwrap();
        let value = batch
            .get_from_batch_and_db(&store, &family, b"k", &ReadOptions::default())
            .unwrap();
        assert_eq!(value, &b"7"[..]);
        assert_eq!(store.reads.load(Ordering::Relaxed), 0);
    }

    #[test_traced]
    fn test_get_from_batch_and_db_falls_through() {
        let family = ColumnFamily::default();
        let mut batch = IndexedWriteBatch::default();
        batch.put(b"a", b"batch").unwrap();
        batch.delete(b"b").unwrap();

        let store = counting(Some(b"stored"));
        let options = ReadOptions::default();
        assert_eq!(read(&batch, &store, b"a"), &b"batch"[..]);
        assert!(matches!(
            batch.get_from_batch_and_db(&store, &family, b"b", &options),
            Err(Error::KeyNotFound)
        ));
        assert_eq!(store.reads.load(Ordering::Relaxed), 0);

        assert_eq!(read(&batch, &store, b"c"), &b"stored"[..]);
        assert_eq!(store.reads.load(Ordering::Relaxed), 1);

        let empty = counting(None);
        assert!(matches!(
            batch.get_from_batch_and_db(&empty, &family, b"c", &options),
            Err(Error::KeyNotFound)
        ));
    }

    #[test_traced]
    fn test_range_delete_shadows_older_entries() {
        let family = ColumnFamily::default();
        let store = counting(Some(b"stored"));
        let options = ReadOptions::default();
        let mut batch = summing();
        batch.put(b"k2", b"1").unwrap();
        batch.merge(b"k3", b"+1").unwrap();
        batch.delete_range(b"k2", b"k4").unwrap();
        batch.merge(b"k3", b"+4").unwrap();

        // Covered keys are deleted, whether buffered or only in the store.
        for key in [&b"k2"[..], b"k2a"] {
            assert!(matches!(
                batch.get_from_batch(&family, key),
                Err(Error::KeyNotFound)
            ));
            assert!(matches!(
                batch.get_from_batch_and_db(&store, &family, key, &options),
                Err(Error::KeyNotFound)
            ));
        }

        // Operands newer than the range apply to an empty base.
        assert_eq!(read(&batch, &store, b"k3"), &b"4"[..]);

        // The end of the range is exclusive.
        assert_eq!(read(&batch, &store, b"k4"), &b"stored"[..]);
        assert_eq!(store.reads.load(Ordering::Relaxed), 1);

        // A put newer than the range is visible.
        batch.put(b"k2", b"again").unwrap();
        assert_eq!(batch.get_from_batch(&family, b"k2").unwrap(), &b"again"[..]);
    }

    #[test_traced]
    fn test_merge_errors() {
        let family = ColumnFamily::default();
        let options = ReadOptions::default();
        let store = counting(Some(b"stored"));

        let mut batch = IndexedWriteBatch::default();
        batch.merge(b"k", b"+1").unwrap();
        assert!(matches!(
            batch.get_from_batch_and_db(&store, &family, b"k", &options),
            Err(Error::MergeOperatorMissing)
        ));

        let mut batch = summing();
        batch.merge(b"k", b"+1").unwrap();
        assert!(matches!(
            batch.get_from_batch_and_db(&store, &family, b"k", &options),
            Err(Error::MergeFailed(_))
        ));

        let failing = Failing {
            attempted: Cell::new(false),
        };
        assert!(matches!(
            batch.get_from_batch_and_db(&failing, &family, b"k", &options),
            Err(Error::Store(_))
        ));
        assert!(failing.attempted.get());
    }

    #[test_traced]
    fn test_save_points_restore_reads() {
        let family = ColumnFamily::default();
        let store = counting(None);
        let options = ReadOptions::default();
        let mut batch = IndexedWriteBatch::new(Config {
            overwrite_key: true,
            ..Default::default()
        });
        batch.put(b"k1", b"v1").unwrap();
        batch.put(b"k2", b"v2").unwrap();
        batch.set_save_point();

        batch.put(b"k1", b"123456789").unwrap();
        batch.delete(b"k2").unwrap();
        batch.put(b"k3", b"v3").unwrap();
        assert_eq!(
            batch.get_from_batch(&family, b"k1").unwrap(),
            &b"123456789"[..]
        );
        batch.set_save_point();

        batch.delete(b"k1").unwrap();
        batch.put(b"k2", b"v2-new").unwrap();
        assert!(matches!(
            batch.get_from_batch(&family, b"k1"),
            Err(Error::KeyNotFound)
        ));

        batch.rollback_to_save_point().unwrap();
        assert_eq!(
            batch.get_from_batch(&family, b"k1").unwrap(),
            &b"123456789"[..]
        );
        assert!(matches!(
            batch.get_from_batch(&family, b"k2"),
            Err(Error::KeyNotFound)
        ));
        assert_eq!(batch.get_from_batch(&family, b"k3").unwrap(), &b"v3"[..]);

        batch.rollback_to_save_point().unwrap();
        assert_eq!(batch.get_from_batch(&family, b"k1").unwrap(), &b"v1"[..]);
        assert_eq!(batch.get_from_batch(&family, b"k2").unwrap(), &b"v2"[..]);
        assert!(matches!(
            batch.get_from_batch_and_db(&store, &family, b"k3", &options),
            Err(Error::KeyNotFound)
        ));
        assert_eq!(batch.count(), 2);
    }

    #[test_traced]
    fn test_resolution_of_column_families() {
        let mut batch = IndexedWriteBatch::default();
        let other = ColumnFamily::new(1, "other", Arc::new(crate::Bytewise));
        batch.put(b"k", b"default").unwrap();
        batch.put_cf(&other, b"k", b"other").unwrap();
        assert_eq!(
            batch.resolve(0, b"k"),
            Resolution::Found(Bytes::from_static(b"default"))
        );
        assert_eq!(batch.get_from_batch(&other, b"k").unwrap(), &b"other"[..]);
        assert_eq!(batch.resolve(2, b"k"), Resolution::Absent);
    }
}
