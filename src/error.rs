//! The errors a load can fail with.

/// Error returned by a load. Besides wrapping the errors produced by the
/// batch function, it covers the ways the batch function can break the
/// loader's contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError<E> {
    /// The batch function returned a different number of outcomes than the
    /// number of keys it was given. Every key in the batch fails with this
    /// error.
    #[error("batch function returned {values} values for {keys} keys")]
    LengthMismatch { keys: usize, values: usize },

    /// The batch function returned no outcome for a single-key call made
    /// with batching disabled.
    #[error("batch function returned no value for the requested key")]
    MissingValue,

    /// The batch function reported a failure for this specific key. Other
    /// keys in the same batch are unaffected.
    #[error("{0}")]
    Key(E),

    /// The batch function itself failed. Every key in the batch fails with
    /// this error.
    #[error("batch failed: {0}")]
    Batch(E),

    /// The batch was dropped before the batch function completed: its
    /// [`Execution`][crate::Execution] was dropped, or the spawner refused
    /// to run it. Every unfinished key in the batch fails with this error.
    #[error("the batch was dropped before it completed")]
    Cancelled,
}

impl<E> LoadError<E> {
    /// Get the batch function's error, if this is a per-key or whole-batch
    /// failure.
    pub fn inner(&self) -> Option<&E> {
        match self {
            LoadError::Key(err) | LoadError::Batch(err) => Some(err),
            _ => None,
        }
    }

    /// Check if this error affected the whole batch, rather than a single
    /// key. Keys that fail this way are not kept in the cache.
    pub fn is_batch_failure(&self) -> bool {
        matches!(
            self,
            LoadError::LengthMismatch { .. } | LoadError::Batch(..) | LoadError::Cancelled
        )
    }
}
