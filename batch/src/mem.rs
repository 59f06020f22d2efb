//! An in-memory store that batches can be read against and written to.
//!
//! [MemStore] keeps one ordered map per column family. It is the reference [DurableStore] used by
//! tests and benchmarks, and shows what a batch expects of the store it is layered over.

use crate::{
    batch::{Handler, WriteBatch},
    comparator::{ColumnFamily, Comparator, OrderedKey},
    merge::{MergeError, MergeOperator},
    store::{BaseIterator, DurableStore, ReadOptions},
};
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    ops::{
        Bound::{Excluded, Included, Unbounded},
        ControlFlow,
    },
    sync::Arc,
};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur when interacting with a [MemStore].
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown column family: {0}")]
    UnknownFamily(u32),
    #[error("merge operator missing")]
    MergeOperatorMissing,
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),
}

/// The contents of one column family.
#[derive(Clone)]
struct Table {
    family: ColumnFamily,
    data: BTreeMap<OrderedKey, Bytes>,
}

impl Table {
    fn probe(&self, key: &[u8]) -> OrderedKey {
        OrderedKey::probe(key, self.family.comparator())
    }
}

/// An in-memory, ordered key-value store with column families.
pub struct MemStore {
    default_family: ColumnFamily,
    tables: BTreeMap<u32, Table>,
    merge_operator: Option<Arc<dyn MergeOperator>>,
}

impl Default for MemStore {
    fn default() -> Self {
        let family = ColumnFamily::default();
        let mut tables = BTreeMap::new();
        tables.insert(
            family.id(),
            Table {
                family: family.clone(),
                data: BTreeMap::new(),
            },
        );
        Self {
            default_family: family,
            tables,
            merge_operator: None,
        }
    }
}

impl MemStore {
    /// Resolve merges written to the store with `operator`.
    pub fn with_merge_operator(mut self, operator: Arc<dyn MergeOperator>) -> Self {
        self.merge_operator = Some(operator);
        self
    }

    /// The family created with the store, ordered bytewise.
    pub fn default_family(&self) -> &ColumnFamily {
        &self.default_family
    }

    /// Create a column family ordered by `comparator`, returning its handle.
    pub fn create_column_family(
        &mut self,
        name: impl Into<String>,
        comparator: Arc<dyn Comparator>,
    ) -> ColumnFamily {
        let id = self.tables.keys().next_back().map_or(0, |id| id + 1);
        let family = ColumnFamily::new(id, name, comparator);
        debug!(id, name = family.name(), "created column family");
        self.tables.insert(
            id,
            Table {
                family: family.clone(),
                data: BTreeMap::new(),
            },
        );
        family
    }

    /// Look up the handle of family `id`.
    pub fn family(&self, id: u32) -> Option<&ColumnFamily> {
        self.tables.get(&id).map(|t| &t.family)
    }

    fn table(&self, family: u32) -> Result<&Table, Error> {
        self.tables.get(&family).ok_or(Error::UnknownFamily(family))
    }

    /// Set `key` to `value` directly.
    pub fn put(&mut self, family: &ColumnFamily, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let table = self
            .tables
            .get_mut(&family.id())
            .ok_or(Error::UnknownFamily(family.id()))?;
        let key = table.probe(key);
        table.data.insert(key, Bytes::copy_from_slice(value));
        Ok(())
    }

    /// Apply every update of `batch`, in log order, as a unit.
    ///
    /// If any update fails, the store is left unchanged.
    pub fn write(&mut self, batch: &WriteBatch) -> Result<(), Error> {
        let mut apply = Apply {
            tables: self.tables.clone(),
            merge_operator: self.merge_operator.as_ref(),
        };
        if let ControlFlow::Break(err) = batch.iterate(&mut apply) {
            return Err(err);
        }
        self.tables = apply.tables;
        debug!(updates = batch.log().len(), "applied batch");
        Ok(())
    }
}

/// Applies the records of a batch to a staged copy of the store.
struct Apply<'a> {
    tables: BTreeMap<u32, Table>,
    merge_operator: Option<&'a Arc<dyn MergeOperator>>,
}

impl Apply<'_> {
    fn table(&mut self, family: u32) -> Result<&mut Table, Error> {
        self.tables
            .get_mut(&family)
            .ok_or(Error::UnknownFamily(family))
    }

    fn apply_merge(&mut self, family: u32, key: &[u8], operand: &[u8]) -> Result<(), Error> {
        let operator = self.merge_operator.ok_or(Error::MergeOperatorMissing)?;
        let table = self.table(family)?;
        let key = table.probe(key);
        let existing = table.data.get(&key).map(|v| v.as_ref());
        let operands = [Bytes::copy_from_slice(operand)];
        let merged = operator.full_merge(key.bytes(), existing, &operands)?;
        table.data.insert(key, merged);
        Ok(())
    }

    fn apply_delete_range(&mut self, family: u32, begin: &[u8], end: &[u8]) -> Result<(), Error> {
        let table = self.table(family)?;
        let (begin, end) = (table.probe(begin), table.probe(end));
        if begin >= end {
            return Ok(());
        }
        let doomed: Vec<_> = table
            .data
            .range((Included(begin), Excluded(end)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            table.data.remove(&key);
        }
        Ok(())
    }
}

fn flow(result: Result<(), Error>) -> ControlFlow<Error> {
    match result {
        Ok(()) => ControlFlow::Continue(()),
        Err(err) => ControlFlow::Break(err),
    }
}

impl Handler for Apply<'_> {
    type Break = Error;

    fn put(&mut self, family: u32, key: &[u8], value: &[u8]) -> ControlFlow<Error> {
        flow(self.table(family).map(|table| {
            let key = table.probe(key);
            table.data.insert(key, Bytes::copy_from_slice(value));
        }))
    }

    fn merge(&mut self, family: u32, key: &[u8], value: &[u8]) -> ControlFlow<Error> {
        flow(self.apply_merge(family, key, value))
    }

    fn delete(&mut self, family: u32, key: &[u8]) -> ControlFlow<Error> {
        flow(self.table(family).map(|table| {
            let key = table.probe(key);
            table.data.remove(&key);
        }))
    }

    fn single_delete(&mut self, family: u32, key: &[u8]) -> ControlFlow<Error> {
        self.delete(family, key)
    }

    fn delete_range(&mut self, family: u32, begin: &[u8], end: &[u8]) -> ControlFlow<Error> {
        flow(self.apply_delete_range(family, begin, end))
    }
}

impl DurableStore for MemStore {
    type Error = Error;
    type Iterator<'a> = MemIterator<'a>;

    fn get(
        &self,
        family: &ColumnFamily,
        key: &[u8],
        _: &ReadOptions,
    ) -> Result<Option<Bytes>, Error> {
        let table = self.table(family.id())?;
        Ok(table.data.get(&table.probe(key)).cloned())
    }

    fn iterator<'a>(
        &'a self,
        family: &ColumnFamily,
        options: &ReadOptions,
    ) -> Result<MemIterator<'a>, Error> {
        let table = self.table(family.id())?;
        let upper_bound = options
            .iterate_upper_bound
            .as_ref()
            .map(|bound| table.probe(bound));
        Ok(MemIterator {
            table,
            upper_bound,
            current: None,
        })
    }
}

/// An ordered cursor over one column family of a [MemStore].
pub struct MemIterator<'a> {
    table: &'a Table,
    upper_bound: Option<OrderedKey>,
    current: Option<(&'a OrderedKey, &'a Bytes)>,
}

impl<'a> MemIterator<'a> {
    fn below_bound(&self, key: &OrderedKey) -> bool {
        self.upper_bound.as_ref().is_none_or(|bound| key < bound)
    }

    fn settle_forward(&mut self, entry: Option<(&'a OrderedKey, &'a Bytes)>) {
        self.current = entry.filter(|(key, _)| self.below_bound(key));
    }

    /// The last entry at or before `to` (or the last overall), below the upper bound.
    fn last_from(&self, to: Option<OrderedKey>) -> Option<(&'a OrderedKey, &'a Bytes)> {
        let to = match (to, self.upper_bound.clone()) {
            (Some(to), Some(bound)) if bound <= to => Excluded(bound),
            (Some(to), _) => Included(to),
            (None, Some(bound)) => Excluded(bound),
            (None, None) => Unbounded,
        };
        self.table.data.range((Unbounded, to)).next_back()
    }
}

impl BaseIterator for MemIterator<'_> {
    type Error = Error;

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        let first = self.table.data.first_key_value();
        self.settle_forward(first);
    }

    fn seek_to_last(&mut self) {
        self.current = self.last_from(None);
    }

    fn seek(&mut self, key: &[u8]) {
        let probe = self.table.probe(key);
        let entry = self.table.data.range((Included(probe), Unbounded)).next();
        self.settle_forward(entry);
    }

    fn seek_for_prev(&mut self, key: &[u8]) {
        let probe = self.table.probe(key);
        self.current = self.last_from(Some(probe));
    }

    fn next(&mut self) {
        let Some((key, _)) = self.current else {
            return;
        };
        let entry = self
            .table
            .data
            .range((Excluded(key.clone()), Unbounded))
            .next();
        self.settle_forward(entry);
    }

    fn prev(&mut self) {
        let Some((key, _)) = self.current else {
            return;
        };
        self.current = self
            .table
            .data
            .range((Unbounded, Excluded(key.clone())))
            .next_back();
    }

    fn key(&self) -> &[u8] {
        self.current.map_or(&[][..], |(key, _)| &key.bytes()[..])
    }

    fn value(&self) -> &[u8] {
        self.current.map_or(&[][..], |(_, value)| value.as_ref())
    }

    fn status(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{batch::WriteBatchBase, comparator::ReverseBytewise, merge::StringAppend};
    use commonware_macros::test_traced;

    fn collect(iter: &mut MemIterator<'_>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push(iter.key().to_vec());
            iter.next();
        }
        out
    }

    #[test_traced]
    fn test_write_batch() {
        let mut store =
            MemStore::default().with_merge_operator(Arc::new(StringAppend::default()));
        let family = store.default_family().clone();
        store.put(&family, b"gone", b"x").unwrap();
        store.put(&family, b"m", b"base").unwrap();

        let mut batch = WriteBatch::default();
        batch.put(b"a", b"1").unwrap();
        batch.delete(b"gone").unwrap();
        batch.merge(b"m", b"more").unwrap();
        batch.put_log_data(b"ignored").unwrap();
        store.write(&batch).unwrap();

        let options = ReadOptions::default();
        assert_eq!(
            store.get(&family, b"a", &options).unwrap().unwrap(),
            &b"1"[..]
        );
        assert!(store.get(&family, b"gone", &options).unwrap().is_none());
        assert_eq!(
            store.get(&family, b"m", &options).unwrap().unwrap(),
            &b"base,more"[..]
        );
    }

    #[test_traced]
    fn test_write_is_atomic() {
        let mut store = MemStore::default();
        let family = store.default_family().clone();
        let mut batch = WriteBatch::default();
        batch.put(b"a", b"1").unwrap();
        let missing = ColumnFamily::new(9, "missing", Arc::new(crate::Bytewise));
        batch.put_cf(&missing, b"b", b"2").unwrap();
        assert!(matches!(store.write(&batch), Err(Error::UnknownFamily(9))));
        assert!(store
            .get(&family, b"a", &ReadOptions::default())
            .unwrap()
            .is_none());

        let mut batch = WriteBatch::default();
        batch.merge(b"a", b"1").unwrap();
        assert!(matches!(
            store.write(&batch),
            Err(Error::MergeOperatorMissing)
        ));
    }

    #[test_traced]
    fn test_delete_range() {
        let mut store = MemStore::default();
        let family = store.default_family().clone();
        for key in [&b"k1"[..], b"k2", b"k3", b"k4"] {
            store.put(&family, key, b"v").unwrap();
        }
        let mut batch = WriteBatch::default();
        batch.delete_range(b"k2", b"k4").unwrap();
        batch.delete_range(b"k9", b"k0").unwrap();
        store.write(&batch).unwrap();

        let mut iter = store.iterator(&family, &ReadOptions::default()).unwrap();
        assert_eq!(collect(&mut iter), vec![b"k1".to_vec(), b"k4".to_vec()]);
    }

    #[test_traced]
    fn test_column_families() {
        let mut store = MemStore::default();
        let reverse = store.create_column_family("reverse", Arc::new(ReverseBytewise));
        assert_eq!(reverse.id(), 1);
        assert_eq!(store.family(1).unwrap().name(), "reverse");
        for key in [&b"a"[..], b"c", b"b"] {
            store.put(&reverse, key, b"v").unwrap();
        }
        let mut iter = store.iterator(&reverse, &ReadOptions::default()).unwrap();
        assert_eq!(
            collect(&mut iter),
            vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
        );

        let unknown = ColumnFamily::new(7, "unknown", Arc::new(crate::Bytewise));
        assert!(matches!(
            store.get(&unknown, b"a", &ReadOptions::default()),
            Err(Error::UnknownFamily(7))
        ));
    }

    #[test_traced]
    fn test_iterator_upper_bound() {
        let mut store = MemStore::default();
        let family = store.default_family().clone();
        for key in [&b"a"[..], b"b", b"c", b"d"] {
            store.put(&family, key, key).unwrap();
        }
        let options = ReadOptions {
            iterate_upper_bound: Some(Bytes::from_static(b"c")),
        };
        let mut iter = store.iterator(&family, &options).unwrap();
        assert_eq!(collect(&mut iter), vec![b"a".to_vec(), b"b".to_vec()]);

        iter.seek_to_last();
        assert_eq!(iter.key(), b"b");
        iter.seek_for_prev(b"z");
        assert_eq!(iter.key(), b"b");
        iter.seek_for_prev(b"a");
        assert_eq!(iter.key(), b"a");
        assert_eq!(iter.value(), b"a");
        iter.prev();
        assert!(!iter.valid());
        iter.seek(b"c");
        assert!(!iter.valid());
        iter.seek(b"bb");
        assert!(!iter.valid());
        iter.seek(b"b");
        assert_eq!(iter.key(), b"b");
        iter.status().unwrap();
    }
}
