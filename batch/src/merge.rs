//! Merge operators fold buffered operands onto an existing value.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Error returned by a [MergeOperator] that cannot combine its inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{operator}: {reason}")]
pub struct MergeError {
    pub operator: String,
    pub reason: String,
}

impl MergeError {
    pub fn new(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            reason: reason.into(),
        }
    }
}

/// A user-supplied associative function combining a base value with operand updates.
pub trait MergeOperator: Send + Sync {
    fn name(&self) -> &str;

    /// Combine `existing` (if any) with `operands`, given oldest first.
    fn full_merge(
        &self,
        key: &[u8],
        existing: Option<&[u8]>,
        operands: &[Bytes],
    ) -> Result<Bytes, MergeError>;
}

/// Joins the existing value and every operand with a delimiter.
#[derive(Clone, Debug)]
pub struct StringAppend {
    delimiter: Bytes,
}

impl StringAppend {
    /// Join operands with `delimiter`.
    pub fn new(delimiter: impl Into<Bytes>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }
}

impl Default for StringAppend {
    fn default() -> Self {
        Self::new(&b","[..])
    }
}

impl MergeOperator for StringAppend {
    fn name(&self) -> &str {
        "strata.StringAppend"
    }

    fn full_merge(
        &self,
        _: &[u8],
        existing: Option<&[u8]>,
        operands: &[Bytes],
    ) -> Result<Bytes, MergeError> {
        let mut out = BytesMut::new();
        let operands = operands.iter().map(|op| &op[..]);
        let parts = existing.into_iter().chain(operands);
        for (i, part) in parts.enumerate() {
            if i > 0 {
                out.extend_from_slice(&self.delimiter);
            }
            out.extend_from_slice(part);
        }
        Ok(out.freeze())
    }
}

/// Adds little-endian `u64` operands to a little-endian `u64` value (absent reads as zero).
#[derive(Clone, Copy, Debug, Default)]
pub struct UInt64Add;

impl UInt64Add {
    const NAME: &'static str = "strata.UInt64Add";

    fn decode(value: &[u8]) -> Result<u64, MergeError> {
        let bytes: [u8; 8] = value
            .try_into()
            .map_err(|_| MergeError::new(Self::NAME, "value is not 8 bytes"))?;
        Ok(u64::from_le_bytes(bytes))
    }
}

impl MergeOperator for UInt64Add {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn full_merge(
        &self,
        _: &[u8],
        existing: Option<&[u8]>,
        operands: &[Bytes],
    ) -> Result<Bytes, MergeError> {
        let mut sum = match existing {
            Some(value) => Self::decode(value)?,
            None => 0,
        };
        for operand in operands {
            sum = sum.wrapping_add(Self::decode(operand)?);
        }
        Ok(Bytes::copy_from_slice(&sum.to_le_bytes()))
    }
}
