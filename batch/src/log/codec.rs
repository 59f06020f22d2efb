//! Binary encoding of [Op]s.

use super::Op;
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{varint::UInt, EncodeSize, Error as CodecError, Read, ReadExt, Write};

// Type bytes identifying each operation.
const PUT: u8 = 1;
const DELETE: u8 = 2;
const SINGLE_DELETE: u8 = 3;
const DELETE_RANGE: u8 = 4;
const MERGE: u8 = 5;
const LOG_DATA: u8 = 6;
const BEGIN_PREPARE: u8 = 7;
const END_PREPARE: u8 = 8;
const COMMIT: u8 = 9;
const ROLLBACK: u8 = 10;

fn write_slice(bytes: &[u8], buf: &mut impl BufMut) {
    UInt(bytes.len() as u64).write(buf);
    buf.put_slice(bytes);
}

fn slice_size(bytes: &[u8]) -> usize {
    UInt(bytes.len() as u64).encode_size() + bytes.len()
}

fn read_slice(buf: &mut impl Buf) -> Result<Bytes, CodecError> {
    let len = UInt::<u64>::read(buf)?.0;
    if len > buf.remaining() as u64 {
        return Err(CodecError::EndOfBuffer);
    }
    Ok(buf.copy_to_bytes(len as usize))
}

fn read_family(buf: &mut impl Buf) -> Result<u32, CodecError> {
    Ok(UInt::<u32>::read(buf)?.0)
}

impl Write for Op {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Op::Put { family, key, value } => {
                PUT.write(buf);
                UInt(*family).write(buf);
                write_slice(key, buf);
                write_slice(value, buf);
            }
            Op::Merge { family, key, value } => {
                MERGE.write(buf);
                UInt(*family).write(buf);
                write_slice(key, buf);
                write_slice(value, buf);
            }
            Op::Delete { family, key } => {
                DELETE.write(buf);
                UInt(*family).write(buf);
                write_slice(key, buf);
            }
            Op::SingleDelete { family, key } => {
                SINGLE_DELETE.write(buf);
                UInt(*family).write(buf);
                write_slice(key, buf);
            }
            Op::DeleteRange { family, begin, end } => {
                DELETE_RANGE.write(buf);
                UInt(*family).write(buf);
                write_slice(begin, buf);
                write_slice(end, buf);
            }
            Op::LogData(blob) => {
                LOG_DATA.write(buf);
                write_slice(blob, buf);
            }
            Op::BeginPrepare => BEGIN_PREPARE.write(buf),
            Op::EndPrepare(xid) => {
                END_PREPARE.write(buf);
                write_slice(xid, buf);
            }
            Op::Commit(xid) => {
                COMMIT.write(buf);
                write_slice(xid, buf);
            }
            Op::Rollback(xid) => {
                ROLLBACK.write(buf);
                write_slice(xid, buf);
            }
        }
    }
}

impl EncodeSize for Op {
    fn encode_size(&self) -> usize {
        1 + match self {
            Op::Put { family, key, value } | Op::Merge { family, key, value } => {
                UInt(*family).encode_size() + slice_size(key) + slice_size(value)
            }
            Op::Delete { family, key } | Op::SingleDelete { family, key } => {
                UInt(*family).encode_size() + slice_size(key)
            }
            Op::DeleteRange { family, begin, end } => {
                UInt(*family).encode_size() + slice_size(begin) + slice_size(end)
            }
            Op::LogData(blob) => slice_size(blob),
            Op::BeginPrepare => 0,
            Op::EndPrepare(xid) | Op::Commit(xid) | Op::Rollback(xid) => slice_size(xid),
        }
    }
}

impl Read for Op {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            PUT => Ok(Op::Put {
                family: read_family(buf)?,
                key: read_slice(buf)?,
                value: read_slice(buf)?,
            }),
            MERGE => Ok(Op::Merge {
                family: read_family(buf)?,
                key: read_slice(buf)?,
                value: read_slice(buf)?,
            }),
            DELETE => Ok(Op::Delete {
                family: read_family(buf)?,
                key: read_slice(buf)?,
            }),
            SINGLE_DELETE => Ok(Op::SingleDelete {
                family: read_family(buf)?,
                key: read_slice(buf)?,
            }),
            DELETE_RANGE => Ok(Op::DeleteRange {
                family: read_family(buf)?,
                begin: read_slice(buf)?,
                end: read_slice(buf)?,
            }),
            LOG_DATA => Ok(Op::LogData(read_slice(buf)?)),
            BEGIN_PREPARE => Ok(Op::BeginPrepare),
            END_PREPARE => Ok(Op::EndPrepare(read_slice(buf)?)),
            COMMIT => Ok(Op::Commit(read_slice(buf)?)),
            ROLLBACK => Ok(Op::Rollback(read_slice(buf)?)),
            e => Err(CodecError::InvalidEnum(e)),
        }
    }
}

/// Decode every operation in `buf`, in order.
pub fn decode_all(mut buf: impl Buf) -> Result<Vec<Op>, CodecError> {
    let mut ops = Vec::new();
    while buf.has_remaining() {
        ops.push(Op::read(&mut buf)?);
    }
    Ok(ops)
}
