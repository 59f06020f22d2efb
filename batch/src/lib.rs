//! Buffer, index, and roll back pending writes ahead of an ordered key-value store.
//!
//! # Overview
//!
//! A [WriteBatch] accumulates mutations (puts, merges, deletes, range deletes, log data, and
//! two-phase-commit markers) in an append-only [log::MutationLog] that is applied to a store as a
//! unit. An [IndexedWriteBatch] additionally maintains an ordered [index::KeyIndex] over those
//! mutations so that pending writes can be read back before they are committed:
//!
//! - [IndexedWriteBatch::get_from_batch] reads a key from the batch alone.
//! - [IndexedWriteBatch::get_from_batch_and_db] reads a key from the batch layered over a
//!   [store::DurableStore], folding buffered merge operands onto the stored value.
//! - [IndexedWriteBatch::iterator_with_base] merges the batch with an ordered store iterator into a
//!   single read-your-own-writes view.
//!
//! Both batch types support nested save points for partial rollback. Rolling back truncates the log
//! and repairs only the index entries touched by the discarded suffix, so the index is always the
//! same as one built by replaying the retained log.
//!
//! # Example
//!
//! ```rust
//! use strata_batch::{mem::MemStore, store::ReadOptions, IndexedWriteBatch, WriteBatchBase};
//!
//! let mut store = MemStore::default();
//! let family = store.default_family().clone();
//! store.put(&family, b"k1", b"stored").unwrap();
//!
//! let mut batch = IndexedWriteBatch::default();
//! batch.put(b"k2", b"pending").unwrap();
//! batch.set_save_point();
//! batch.delete(b"k1").unwrap();
//! batch.rollback_to_save_point().unwrap();
//!
//! let options = ReadOptions::default();
//! let value = batch.get_from_batch_and_db(&store, &family, b"k1", &options).unwrap();
//! assert_eq!(value.as_ref(), b"stored");
//! let value = batch.get_from_batch(&family, b"k2").unwrap();
//! assert_eq!(value.as_ref(), b"pending");
//! ```
//!
//! # Status
//!
//! `strata-batch` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

pub mod batch;
pub mod comparator;
mod error;
pub mod index;
pub mod indexed;
pub mod log;
pub mod mem;
pub mod merge;
pub mod savepoint;
pub mod store;

pub use batch::{Handler, WriteBatch, WriteBatchBase};
pub use comparator::{Bytewise, ColumnFamily, Comparator, ReverseBytewise};
pub use error::Error;
pub use indexed::{BaseDeltaIterator, Config, IndexedWriteBatch, WriteBatchIterator, WriteEntry};
pub use log::{Entry, Op, OpType};
pub use merge::{MergeError, MergeOperator};
