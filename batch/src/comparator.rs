//! Key orderings and the column family handles that carry them.
//!
//! Every column family is ordered by exactly one [Comparator]. A batch binds a family's comparator
//! on first use and rejects any later handle for the same family that names a different one.

use bytes::Bytes;
use std::{cmp::Ordering, fmt, sync::Arc};

/// The identifier of the column family used when none is specified.
pub const DEFAULT_FAMILY: u32 = 0;

/// A total order over keys.
///
/// Implementations must be deterministic: the same pair of keys must always compare the same way
/// for the lifetime of any batch or store using the comparator.
pub trait Comparator: Send + Sync {
    /// The name used to detect attempts to swap orderings on an existing family.
    fn name(&self) -> &str;

    /// Compare two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bytewise;

impl Comparator for Bytewise {
    fn name(&self) -> &str {
        "strata.Bytewise"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Reverse lexicographic byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReverseBytewise;

impl Comparator for ReverseBytewise {
    fn name(&self) -> &str {
        "strata.ReverseBytewise"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }
}

/// A handle naming a column family and the ordering of its keys.
#[derive(Clone)]
pub struct ColumnFamily {
    id: u32,
    name: String,
    comparator: Arc<dyn Comparator>,
}

impl ColumnFamily {
    /// Create a handle for family `id`.
    pub fn new(id: u32, name: impl Into<String>, comparator: Arc<dyn Comparator>) -> Self {
        Self {
            id,
            name: name.into(),
            comparator,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ordering of keys in this family.
    pub fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.comparator
    }
}

impl Default for ColumnFamily {
    fn default() -> Self {
        Self::new(DEFAULT_FAMILY, "default", Arc::new(Bytewise))
    }
}

impl fmt::Debug for ColumnFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnFamily")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("comparator", &self.comparator.name())
            .finish()
    }
}

/// A key that orders itself with the comparator of the family it belongs to.
///
/// Used as the key of ordered maps whose order is only known at runtime.
#[derive(Clone)]
pub(crate) struct OrderedKey {
    bytes: Bytes,
    comparator: Arc<dyn Comparator>,
}

impl OrderedKey {
    pub(crate) fn new(bytes: Bytes, comparator: Arc<dyn Comparator>) -> Self {
        Self { bytes, comparator }
    }

    /// Build a probe for a lookup, copying `key`.
    pub(crate) fn probe(key: &[u8], comparator: &Arc<dyn Comparator>) -> Self {
        Self::new(Bytes::copy_from_slice(key), comparator.clone())
    }

    pub(crate) fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparator.compare(&self.bytes, &other.bytes)
    }
}

impl fmt::Debug for OrderedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", commonware_utils::hex(&self.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_reverse_bytewise_orders_map() {
        let comparator: Arc<dyn Comparator> = Arc::new(ReverseBytewise);
        let mut map = BTreeMap::new();
        for key in [b"a", b"c", b"b"] {
            map.insert(OrderedKey::probe(key, &comparator), ());
        }
        let keys: Vec<_> = map.keys().map(|k| k.bytes().clone()).collect();
        assert_eq!(keys, vec![&b"c"[..], &b"b"[..], &b"a"[..]]);
    }

    #[test]
    fn test_default_family() {
        let family = ColumnFamily::default();
        assert_eq!(family.id(), DEFAULT_FAMILY);
        assert_eq!(family.comparator().name(), Bytewise.name());
    }
}
