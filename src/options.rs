use std::{
    fmt::{self, Debug, Formatter},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

/// A function mapping a load key to the key used for caching. Keys that map
/// to the same cache key share a single cached result.
pub type CacheKeyFn<Key> = Arc<dyn Fn(&Key) -> Key + Send + Sync>;

/// LoaderOptions defines the behavior of a [`Loader`][crate::Loader].
#[derive(Clone)]
pub struct LoaderOptions<Key> {
    /// If false, every load immediately calls the batch function with just
    /// that key, instead of queueing it for the next batch.
    pub batching: bool,

    /// If false, results are not memoized, and duplicate keys are passed
    /// through to the batch function.
    pub caching: bool,

    /// The maximum number of keys passed to a single call of the batch
    /// function. Larger queues are split into several calls.
    pub max_batch_size: Option<NonZeroUsize>,

    /// How long to wait after the first key of a batch is queued before
    /// executing it automatically. If `None`, queued keys are only loaded
    /// when [`Loader::execute`][crate::Loader::execute] is called.
    pub execution_period: Option<Duration>,

    /// Normalizes keys before they're used for cache lookups. If `None`, the
    /// key itself is used.
    pub cache_key: Option<CacheKeyFn<Key>>,
}

impl<Key> Default for LoaderOptions<Key> {
    fn default() -> Self {
        Self {
            batching: true,
            caching: true,
            max_batch_size: None,
            execution_period: None,
            cache_key: None,
        }
    }
}

impl<Key> Debug for LoaderOptions<Key> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderOptions")
            .field("batching", &self.batching)
            .field("caching", &self.caching)
            .field("max_batch_size", &self.max_batch_size)
            .field("execution_period", &self.execution_period)
            .field("cache_key", &self.cache_key.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

impl<Key> LoaderOptions<Key> {
    pub fn with_batching(self, batching: bool) -> Self {
        Self { batching, ..self }
    }

    pub fn with_caching(self, caching: bool) -> Self {
        Self { caching, ..self }
    }

    /// Set the maximum batch size. A size of 0 means no limit.
    pub fn with_max_batch_size(self, max_batch_size: usize) -> Self {
        Self {
            max_batch_size: NonZeroUsize::new(max_batch_size),
            ..self
        }
    }

    pub fn with_execution_period(self, period: Duration) -> Self {
        Self {
            execution_period: Some(period),
            ..self
        }
    }

    pub fn with_cache_key(self, cache_key: impl Fn(&Key) -> Key + Send + Sync + 'static) -> Self {
        Self {
            cache_key: Some(Arc::new(cache_key)),
            ..self
        }
    }
}

impl<Key: Clone> LoaderOptions<Key> {
    /// Get the cache key for `key`.
    pub(crate) fn cache_key_for(&self, key: &Key) -> Key {
        match self.cache_key {
            Some(ref normalize) => normalize(key),
            None => key.clone(),
        }
    }
}
