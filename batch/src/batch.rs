//! A batch of operations applied to a store as a unit.
//!
//! [WriteBatch] buffers operations in a [MutationLog] without indexing them. It tracks the number
//! of updates, the encoded size and the [ContentFlags] of everything buffered. Save points nest,
//! and the batch can be replayed in log order through a [Handler].
//!
//! Operations on a batch have no effect on any store until the batch is written to one.

use crate::{
    comparator::ColumnFamily,
    log::{codec, Entry, MutationLog, Op},
    savepoint::{ContentFlags, SavePoint, SavePointStack},
    Error,
};
use bytes::{Bytes, BytesMut};
use commonware_codec::{EncodeSize, Write};
use std::ops::ControlFlow;
use tracing::debug;

/// The write surface shared by [WriteBatch] and [crate::IndexedWriteBatch].
///
/// Methods without a column family argument target the batch's default family.
pub trait WriteBatchBase {
    /// The family targeted by methods without a family argument.
    fn default_family(&self) -> &ColumnFamily;

    /// The underlying (unindexed) batch.
    fn batch(&self) -> &WriteBatch;

    /// Buffer `op`, returning its sequence.
    fn record(&mut self, family: Option<&ColumnFamily>, op: Op) -> Result<u64, Error>;

    /// Drop every buffered operation and save point.
    fn clear(&mut self);

    /// Set a save point that can later be rolled back to.
    fn set_save_point(&mut self);

    /// Discard everything buffered since the most recent save point and remove it.
    fn rollback_to_save_point(&mut self) -> Result<(), Error>;

    /// Remove the most recent save point without rolling back.
    fn pop_save_point(&mut self) -> Result<(), Error>;

    /// Limit the encoded size of the batch (0 means unlimited).
    fn set_max_bytes(&mut self, max_bytes: usize);

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let family = self.default_family().clone();
        self.put_cf(&family, key, value)
    }

    fn put_cf(&mut self, family: &ColumnFamily, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let op = Op::Put {
            family: family.id(),
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        };
        self.record(Some(family), op).map(|_| ())
    }

    fn merge(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let family = self.default_family().clone();
        self.merge_cf(&family, key, value)
    }

    fn merge_cf(&mut self, family: &ColumnFamily, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let op = Op::Merge {
            family: family.id(),
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        };
        self.record(Some(family), op).map(|_| ())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        let family = self.default_family().clone();
        self.delete_cf(&family, key)
    }

    fn delete_cf(&mut self, family: &ColumnFamily, key: &[u8]) -> Result<(), Error> {
        let op = Op::Delete {
            family: family.id(),
            key: Bytes::copy_from_slice(key),
        };
        self.record(Some(family), op).map(|_| ())
    }

    /// Remove `key`, which must have been produced by exactly one put since it was last removed.
    fn single_delete(&mut self, key: &[u8]) -> Result<(), Error> {
        let family = self.default_family().clone();
        self.single_delete_cf(&family, key)
    }

    fn single_delete_cf(&mut self, family: &ColumnFamily, key: &[u8]) -> Result<(), Error> {
        let op = Op::SingleDelete {
            family: family.id(),
            key: Bytes::copy_from_slice(key),
        };
        self.record(Some(family), op).map(|_| ())
    }

    /// Remove every key in `[begin, end)`. It is not an error if no such key exists.
    fn delete_range(&mut self, begin: &[u8], end: &[u8]) -> Result<(), Error> {
        let family = self.default_family().clone();
        self.delete_range_cf(&family, begin, end)
    }

    fn delete_range_cf(
        &mut self,
        family: &ColumnFamily,
        begin: &[u8],
        end: &[u8],
    ) -> Result<(), Error> {
        let op = Op::DeleteRange {
            family: family.id(),
            begin: Bytes::copy_from_slice(begin),
            end: Bytes::copy_from_slice(end),
        };
        self.record(Some(family), op).map(|_| ())
    }

    /// Append a blob that is carried with the batch (in order) but never applied or counted.
    fn put_log_data(&mut self, blob: &[u8]) -> Result<(), Error> {
        self.record(None, Op::LogData(Bytes::copy_from_slice(blob)))
            .map(|_| ())
    }

    fn mark_begin_prepare(&mut self) -> Result<(), Error> {
        self.record(None, Op::BeginPrepare).map(|_| ())
    }

    fn mark_end_prepare(&mut self, xid: &[u8]) -> Result<(), Error> {
        self.record(None, Op::EndPrepare(Bytes::copy_from_slice(xid)))
            .map(|_| ())
    }

    fn mark_commit(&mut self, xid: &[u8]) -> Result<(), Error> {
        self.record(None, Op::Commit(Bytes::copy_from_slice(xid)))
            .map(|_| ())
    }

    fn mark_rollback(&mut self, xid: &[u8]) -> Result<(), Error> {
        self.record(None, Op::Rollback(Bytes::copy_from_slice(xid)))
            .map(|_| ())
    }

    /// Number of updates (puts, merges, deletes, single deletes, and range deletes) buffered.
    fn count(&self) -> u32 {
        self.batch().count
    }

    /// Encoded size of the batch in bytes.
    fn data_size(&self) -> usize {
        self.batch().data_size
    }

    /// Serialize the batch.
    fn data(&self) -> Bytes {
        self.batch().serialize()
    }
}

/// Receives the records of a batch, in log order, from [WriteBatch::iterate].
///
/// Every callback defaults to continuing. Returning [ControlFlow::Break] stops the replay.
#[allow(unused_variables)]
pub trait Handler {
    type Break;

    fn put(&mut self, family: u32, key: &[u8], value: &[u8]) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn merge(&mut self, family: u32, key: &[u8], value: &[u8]) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn delete(&mut self, family: u32, key: &[u8]) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn single_delete(&mut self, family: u32, key: &[u8]) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn delete_range(&mut self, family: u32, begin: &[u8], end: &[u8]) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn log_data(&mut self, blob: &[u8]) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn mark_begin_prepare(&mut self) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn mark_end_prepare(&mut self, xid: &[u8]) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn mark_commit(&mut self, xid: &[u8]) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn mark_rollback(&mut self, xid: &[u8]) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }
}

/// An unindexed batch of operations.
#[derive(Debug)]
pub struct WriteBatch {
    default_family: ColumnFamily,
    log: MutationLog,
    save_points: SavePointStack,
    wal_termination_point: Option<SavePoint>,

    count: u32,
    data_size: usize,
    content_flags: ContentFlags,
    max_bytes: usize,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new(ColumnFamily::default())
    }
}

impl WriteBatch {
    /// Create an empty batch whose family-less methods target `default_family`.
    pub fn new(default_family: ColumnFamily) -> Self {
        Self {
            default_family,
            log: MutationLog::new(),
            save_points: SavePointStack::default(),
            wal_termination_point: None,
            count: 0,
            data_size: 0,
            content_flags: ContentFlags::EMPTY,
            max_bytes: 0,
        }
    }

    /// Rebuild a batch from the output of [WriteBatchBase::data].
    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        let mut batch = Self::default();
        for op in codec::decode_all(data)? {
            batch.append(op)?;
        }
        debug!(entries = batch.log.len(), "deserialized batch");
        Ok(batch)
    }

    pub(crate) fn append(&mut self, op: Op) -> Result<u64, Error> {
        let size = op.encode_size();
        if self.max_bytes > 0 && self.data_size + size > self.max_bytes {
            return Err(Error::MemoryLimit {
                size: self.data_size + size,
                max: self.max_bytes,
            });
        }
        let op_type = op.op_type();
        if op_type.is_update() {
            self.count += 1;
        }
        self.content_flags |= ContentFlags::of(op_type);
        self.data_size += size;
        Ok(self.log.append(op))
    }

    /// Pop the most recent save point and truncate the log to it, returning the discarded entries.
    pub(crate) fn rollback(&mut self) -> Result<Vec<Entry>, Error> {
        let point = self.save_points.pop()?;
        let removed = self.log.truncate_to(point.size)?;

        // Recompute the shape of the retained prefix.
        self.count = 0;
        self.data_size = 0;
        self.content_flags = ContentFlags::EMPTY;
        for entry in self.log.forward() {
            let op_type = entry.op.op_type();
            if op_type.is_update() {
                self.count += 1;
            }
            self.content_flags |= ContentFlags::of(op_type);
            self.data_size += entry.op.encode_size();
        }
        debug_assert_eq!(self.save_point(), point);

        if matches!(self.wal_termination_point, Some(wal) if wal.size > point.size) {
            self.wal_termination_point = None;
        }
        debug!(
            size = point.size,
            removed = removed.len(),
            remaining_save_points = self.save_points.len(),
            "rolled back to save point"
        );
        Ok(removed)
    }

    /// The current shape of the batch.
    pub fn save_point(&self) -> SavePoint {
        SavePoint {
            size: self.log.len(),
            count: self.count,
            data_size: self.data_size,
            content_flags: self.content_flags,
        }
    }

    /// The operations recorded so far, in order.
    pub fn log(&self) -> &MutationLog {
        &self.log
    }

    /// The kinds of operation recorded so far. Rollbacks recompute the flags from what remains.
    pub fn content_flags(&self) -> ContentFlags {
        self.content_flags
    }

    /// Whether the batch holds a put.
    pub fn has_put(&self) -> bool {
        self.content_flags.contains(ContentFlags::HAS_PUT)
    }

    pub fn has_delete(&self) -> bool {
        self.content_flags.contains(ContentFlags::HAS_DELETE)
    }

    pub fn has_single_delete(&self) -> bool {
        self.content_flags.contains(ContentFlags::HAS_SINGLE_DELETE)
    }

    pub fn has_delete_range(&self) -> bool {
        self.content_flags.contains(ContentFlags::HAS_DELETE_RANGE)
    }

    pub fn has_merge(&self) -> bool {
        self.content_flags.contains(ContentFlags::HAS_MERGE)
    }

    pub fn has_begin_prepare(&self) -> bool {
        self.content_flags.contains(ContentFlags::HAS_BEGIN_PREPARE)
    }

    pub fn has_end_prepare(&self) -> bool {
        self.content_flags.contains(ContentFlags::HAS_END_PREPARE)
    }

    pub fn has_commit(&self) -> bool {
        self.content_flags.contains(ContentFlags::HAS_COMMIT)
    }

    pub fn has_rollback(&self) -> bool {
        self.content_flags.contains(ContentFlags::HAS_ROLLBACK)
    }

    /// Mark the current position as the last record to be written to a write-ahead log.
    pub fn mark_wal_termination_point(&mut self) {
        self.wal_termination_point = Some(self.save_point());
    }

    /// The position set by [WriteBatch::mark_wal_termination_point], if still within the batch.
    pub fn wal_termination_point(&self) -> Option<SavePoint> {
        self.wal_termination_point
    }

    /// Replay every record, in log order, to `handler`.
    pub fn iterate<H: Handler>(&self, handler: &mut H) -> ControlFlow<H::Break> {
        for entry in self.log.forward() {
            match &entry.op {
                Op::Put { family, key, value } => handler.put(*family, key, value)?,
                Op::Merge { family, key, value } => handler.merge(*family, key, value)?,
                Op::Delete { family, key } => handler.delete(*family, key)?,
                Op::SingleDelete { family, key } => handler.single_delete(*family, key)?,
                Op::DeleteRange { family, begin, end } => {
                    handler.delete_range(*family, begin, end)?
                }
                Op::LogData(blob) => handler.log_data(blob)?,
                Op::BeginPrepare => handler.mark_begin_prepare()?,
                Op::EndPrepare(xid) => handler.mark_end_prepare(xid)?,
                Op::Commit(xid) => handler.mark_commit(xid)?,
                Op::Rollback(xid) => handler.mark_rollback(xid)?,
            }
        }
        ControlFlow::Continue(())
    }

    fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.data_size);
        for entry in self.log.forward() {
            entry.op.write(&mut buf);
        }
        buf.freeze()
    }
}

impl WriteBatchBase for WriteBatch {
    fn default_family(&self) -> &ColumnFamily {
        &self.default_family
    }

    fn batch(&self) -> &WriteBatch {
        self
    }

    fn record(&mut self, _: Option<&ColumnFamily>, op: Op) -> Result<u64, Error> {
        self.append(op)
    }

    fn clear(&mut self) {
        self.log.clear();
        self.save_points.clear();
        self.wal_termination_point = None;
        self.count = 0;
        self.data_size = 0;
        self.content_flags = ContentFlags::EMPTY;
    }

    fn set_save_point(&mut self) {
        let point = self.save_point();
        debug!(size = point.size, "set save point");
        self.save_points.push(point);
    }

    fn rollback_to_save_point(&mut self) -> Result<(), Error> {
        self.rollback().map(|_| ())
    }

    fn pop_save_point(&mut self) -> Result<(), Error> {
        self.save_points.pop().map(|_| ())
    }

    fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
    }
}
