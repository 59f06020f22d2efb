use crate::merge::MergeError;
use thiserror::Error;

/// Errors that can occur when interacting with a batch.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("key not found")]
    KeyNotFound,
    #[error("merge in progress")]
    MergeInProgress,
    #[error("corrupt batch: {0}")]
    CorruptBatch(#[from] commonware_codec::Error),
    #[error("comparator mismatch on family {family}: bound {bound}, requested {requested}")]
    ComparatorMismatch {
        family: u32,
        bound: String,
        requested: String,
    },
    #[error("iterator invalidated")]
    IteratorInvalidated,
    #[error("memory limit: {size} > {max}")]
    MemoryLimit { size: usize, max: usize },
    #[error("merge operator missing")]
    MergeOperatorMissing,
    #[error("merge failed: {0}")]
    MergeFailed(#[from] MergeError),
    #[error("store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an error returned by a store capability.
    pub fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Store(Box::new(err))
    }
}
