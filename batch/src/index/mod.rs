//! An ordered index over the entries of a [crate::log::MutationLog].
//!
//! For every column family, [KeyIndex] maps each key (ordered by the family's
//! [crate::comparator::Comparator]) to the sequences of the point operations (put, merge, delete,
//! single delete) buffered for it, oldest first. Range deletes are not point keys: they are kept
//! per family as a list of [RangeTombstone]s in log order.
//!
//! The index holds nothing that cannot be recomputed by replaying the log. After the log is
//! truncated, [KeyIndex::rebuild_suffix] repairs only the keys touched by the discarded entries: a
//! key's references are stored oldest first, so dropping those at or past the truncation point
//! restores exactly the references of the retained prefix.
//!
//! # Overwrite Mode
//!
//! When `overwrite_key` is set, only the newest reference of each key is visible to lookups and
//! iteration. Superseded references are still retained so that merge operands can be resolved
//! against the full history of a key.

use crate::{
    comparator::{ColumnFamily, Comparator, OrderedKey, DEFAULT_FAMILY},
    log::{Entry, Op},
    Error,
};
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    ops::Bound::{Excluded, Included, Unbounded},
    sync::Arc,
};
use tracing::debug;

/// A buffered deletion of every key in `[begin, end)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeTombstone {
    pub begin: Bytes,
    pub end: Bytes,
    pub sequence: u64,
}

/// The index of a single column family.
struct Family {
    comparator: Arc<dyn Comparator>,

    // Sequences per key are stored in ascending order.
    keys: BTreeMap<OrderedKey, Vec<u64>>,

    // Stored in log order.
    ranges: Vec<RangeTombstone>,
}

impl Family {
    fn new(comparator: Arc<dyn Comparator>) -> Self {
        Self {
            comparator,
            keys: BTreeMap::new(),
            ranges: Vec::new(),
        }
    }

    fn probe(&self, key: &[u8]) -> OrderedKey {
        OrderedKey::probe(key, &self.comparator)
    }

    fn covers(&self, range: &RangeTombstone, key: &[u8]) -> bool {
        self.comparator.compare(&range.begin, key).is_le()
            && self.comparator.compare(key, &range.end).is_lt()
    }
}

/// A key of the index and its references, as returned by positional lookups.
pub(crate) type Slot<'a> = (&'a OrderedKey, &'a [u64]);

/// A per-column-family ordered index over buffered operations.
pub struct KeyIndex {
    overwrite_key: bool,
    default_comparator: Arc<dyn Comparator>,
    families: BTreeMap<u32, Family>,
}

impl KeyIndex {
    /// Create an empty index. The default family, and any family never bound with
    /// [KeyIndex::bind], is ordered by `default_comparator`.
    pub fn new(overwrite_key: bool, default_comparator: Arc<dyn Comparator>) -> Self {
        let mut families = BTreeMap::new();
        families.insert(DEFAULT_FAMILY, Family::new(default_comparator.clone()));
        Self {
            overwrite_key,
            default_comparator,
            families,
        }
    }

    pub fn overwrite_key(&self) -> bool {
        self.overwrite_key
    }

    /// Fail if `family` is already ordered by a comparator other than the one its handle names.
    pub fn check(&self, family: &ColumnFamily) -> Result<(), Error> {
        let requested = family.comparator();
        match self.families.get(&family.id()) {
            Some(bound) if bound.comparator.name() != requested.name() => {
                Err(Error::ComparatorMismatch {
                    family: family.id(),
                    bound: bound.comparator.name().to_string(),
                    requested: requested.name().to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Bind the comparator of `family`, failing if the family is already ordered by another.
    pub fn bind(&mut self, family: &ColumnFamily) -> Result<(), Error> {
        self.check(family)?;
        let requested = family.comparator();
        match self.families.get(&family.id()) {
            Some(_) => Ok(()),
            None => {
                debug!(
                    family = family.id(),
                    comparator = requested.name(),
                    "bound family"
                );
                self.families
                    .insert(family.id(), Family::new(requested.clone()));
                Ok(())
            }
        }
    }

    /// The comparator ordering `family`.
    pub fn comparator(&self, family: u32) -> &Arc<dyn Comparator> {
        self.families
            .get(&family)
            .map_or(&self.default_comparator, |f| &f.comparator)
    }

    fn family_mut(&mut self, family: u32) -> &mut Family {
        let default = &self.default_comparator;
        self.families
            .entry(family)
            .or_insert_with(|| Family::new(default.clone()))
    }

    /// Index `entry`. Entries that are neither point operations nor range deletes are ignored.
    pub fn insert(&mut self, entry: &Entry) {
        match &entry.op {
            Op::Put { family, key, .. }
            | Op::Merge { family, key, .. }
            | Op::Delete { family, key }
            | Op::SingleDelete { family, key } => {
                let family = self.family_mut(*family);
                let key = OrderedKey::new(key.clone(), family.comparator.clone());
                family.keys.entry(key).or_default().push(entry.sequence);
            }
            Op::DeleteRange { family, begin, end } => {
                self.family_mut(*family).ranges.push(RangeTombstone {
                    begin: begin.clone(),
                    end: end.clone(),
                    sequence: entry.sequence,
                });
            }
            _ => {}
        }
    }

    fn refs(&self, family: u32, key: &[u8]) -> Option<&[u64]> {
        let family = self.families.get(&family)?;
        family.keys.get(&family.probe(key)).map(Vec::as_slice)
    }

    /// Narrow a key's references to those visible under the indexing mode.
    pub(crate) fn visible<'a>(&self, refs: &'a [u64]) -> &'a [u64] {
        if self.overwrite_key && !refs.is_empty() {
            &refs[refs.len() - 1..]
        } else {
            refs
        }
    }

    /// The newest reference buffered for `key`.
    pub fn lookup_latest(&self, family: u32, key: &[u8]) -> Option<u64> {
        self.refs(family, key)?.last().copied()
    }

    /// Every reference buffered for `key`, newest first, regardless of the indexing mode.
    pub fn lookup_chain(&self, family: u32, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        self.refs(family, key)
            .unwrap_or_default()
            .iter()
            .rev()
            .copied()
    }

    /// The references of `key` visible under the indexing mode, oldest first.
    pub fn lookup_visible(&self, family: u32, key: &[u8]) -> &[u64] {
        self.visible(self.refs(family, key).unwrap_or_default())
    }

    /// Every key of `family` with its newest reference, in comparator order.
    pub fn ordered_keys(&self, family: u32) -> impl Iterator<Item = (&Bytes, u64)> + '_ {
        self.families
            .get(&family)
            .into_iter()
            .flat_map(|f| f.keys.iter())
            .filter_map(|(key, refs)| Some((key.bytes(), *refs.last()?)))
    }

    /// The range deletes buffered for `family`, in log order.
    pub fn range_tombstones(&self, family: u32) -> &[RangeTombstone] {
        self.families
            .get(&family)
            .map_or(&[][..], |f| f.ranges.as_slice())
    }

    /// The sequence of the newest range delete of `family` covering `key`.
    pub fn covering_tombstone(&self, family: u32, key: &[u8]) -> Option<u64> {
        let family = self.families.get(&family)?;
        family
            .ranges
            .iter()
            .rev()
            .find(|range| family.covers(range, key))
            .map(|range| range.sequence)
    }

    /// Number of distinct point keys across all families.
    pub fn keys(&self) -> usize {
        self.families.values().map(|f| f.keys.len()).sum()
    }

    /// Repair the index after the log was truncated to `from_length`.
    ///
    /// `removed` are the discarded entries (every one has a sequence at or past `from_length`).
    /// Only keys and families touched by `removed` are visited.
    pub fn rebuild_suffix(&mut self, from_length: usize, removed: &[Entry]) {
        let from = from_length as u64;
        for entry in removed {
            debug_assert!(entry.sequence >= from);
            let Some(id) = entry.op.family() else {
                continue;
            };
            let Some(family) = self.families.get_mut(&id) else {
                continue;
            };
            match &entry.op {
                Op::DeleteRange { .. } => family.ranges.retain(|r| r.sequence < from),
                op => {
                    let Some(key) = op.key() else {
                        continue;
                    };
                    let probe = family.probe(key);
                    let Some(refs) = family.keys.get_mut(&probe) else {
                        continue;
                    };
                    while refs.last().is_some_and(|seq| *seq >= from) {
                        refs.pop();
                    }
                    if refs.is_empty() {
                        family.keys.remove(&probe);
                    }
                }
            }
        }
    }

    /// Drop every indexed key and range. Family bindings are kept.
    pub fn clear(&mut self) {
        for family in self.families.values_mut() {
            family.keys.clear();
            family.ranges.clear();
        }
    }

    pub(crate) fn first(&self, family: u32) -> Option<Slot<'_>> {
        let (key, refs) = self.families.get(&family)?.keys.first_key_value()?;
        Some((key, refs.as_slice()))
    }

    pub(crate) fn last(&self, family: u32) -> Option<Slot<'_>> {
        let (key, refs) = self.families.get(&family)?.keys.last_key_value()?;
        Some((key, refs.as_slice()))
    }

    /// The first key at or past `key`.
    pub(crate) fn seek(&self, family: u32, key: &[u8]) -> Option<Slot<'_>> {
        let family = self.families.get(&family)?;
        let (key, refs) = family
            .keys
            .range((Included(family.probe(key)), Unbounded))
            .next()?;
        Some((key, refs.as_slice()))
    }

    /// The last key at or before `key`.
    pub(crate) fn seek_for_prev(&self, family: u32, key: &[u8]) -> Option<Slot<'_>> {
        let family = self.families.get(&family)?;
        let (key, refs) = family
            .keys
            .range((Unbounded, Included(family.probe(key))))
            .next_back()?;
        Some((key, refs.as_slice()))
    }

    /// The first key strictly after `key`.
    pub(crate) fn after(&self, family: u32, key: &OrderedKey) -> Option<Slot<'_>> {
        let (key, refs) = self
            .families
            .get(&family)?
            .keys
            .range((Excluded(key.clone()), Unbounded))
            .next()?;
        Some((key, refs.as_slice()))
    }

    /// The last key strictly before `key`.
    pub(crate) fn before(&self, family: u32, key: &OrderedKey) -> Option<Slot<'_>> {
        let (key, refs) = self
            .families
            .get(&family)?
            .keys
            .range((Unbounded, Excluded(key.clone())))
            .next_back()?;
        Some((key, refs.as_slice()))
    }
}
