use std::{future::Future, num::NonZeroUsize};

/// The function a [`Loader`][crate::Loader] uses to load a batch of keys.
///
/// `load` is called with the keys of one batch, in the order they were
/// requested. It must return exactly one outcome per key, in the same order:
/// `Ok(value)` for keys that were loaded, `Err(error)` for keys that
/// individually failed. If the whole batch fails, return a single `Err`
/// instead; every key in the batch will fail with that error.
///
/// This trait is implemented for any `Fn(Vec<Key>) -> Future` closure or
/// async fn with the right output, so most of the time you won't need to
/// implement it yourself:
///
/// ```
/// use memoloader::BatchFn;
///
/// async fn double(keys: Vec<u32>) -> Result<Vec<Result<u32, String>>, String> {
///     Ok(keys.into_iter().map(|key| Ok(key * 2)).collect())
/// }
///
/// fn assert_batch_fn(_: &impl BatchFn<u32, u32, String>) {}
/// assert_batch_fn(&double);
/// ```
pub trait BatchFn<Key, Value, Error> {
    type Future: Future<Output = Result<Vec<Result<Value, Error>>, Error>>;

    fn load(&self, keys: Vec<Key>) -> Self::Future;
}

impl<Key, Value, Error, Func, Fut> BatchFn<Key, Value, Error> for Func
where
    Func: Fn(Vec<Key>) -> Fut,
    Fut: Future<Output = Result<Vec<Result<Value, Error>>, Error>>,
{
    type Future = Fut;

    #[inline]
    fn load(&self, keys: Vec<Key>) -> Fut {
        self(keys)
    }
}

/// Split a queue into consecutive chunks of at most `max_size` items,
/// preserving order.
pub(crate) fn chunks<T>(mut queue: Vec<T>, max_size: Option<NonZeroUsize>) -> Vec<Vec<T>> {
    let size = match max_size {
        Some(max_size) if max_size.get() < queue.len() => max_size.get(),
        _ => return vec![queue],
    };

    let mut chunks = Vec::with_capacity(queue.len().div_ceil(size));
    while queue.len() > size {
        let rest = queue.split_off(size);
        chunks.push(queue);
        queue = rest;
    }
    chunks.push(queue);
    chunks
}
