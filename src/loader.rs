use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    future::{self, TryJoinAll},
    ready,
};
use futures_timer::Delay;
use parking_lot::Mutex;

use crate::{
    batch::{self, BatchFn},
    cell::{ResultCell, Wait},
    error::LoadError,
    options::LoaderOptions,
    spawn::SpawnTask,
};

/// The future returned by [`Loader::load`]. Completes once the key's batch
/// has been executed.
pub type LoadFuture<Value, Error> = Wait<Value, LoadError<Error>>;

type Cell<Value, Error> = ResultCell<Value, LoadError<Error>>;
type Queue<Key, Value, Error> = Vec<(Key, Cell<Value, Error>)>;

struct State<Key, Value, Error> {
    // Keyed by cache key. Only populated while caching is enabled.
    cache: HashMap<Key, Cell<Value, Error>>,

    // Keyed by the original load key, in arrival order.
    queue: Queue<Key, Value, Error>,

    // True if a timer is running for the current generation of the queue.
    // A generation ends each time the queue is taken for execution.
    scheduled: bool,
    generation: u64,
}

/// What `load` needs to do once the state lock is released.
enum Then<Key> {
    Queued,
    Schedule { period: Duration, generation: u64 },
    Spawn(Key),
}

/// The parts of a loader that executions need. Doesn't include the spawner,
/// so that background tasks don't need it to be Send.
struct Core<Key, Value, Error, Batcher> {
    batcher: Batcher,
    options: LoaderOptions<Key>,
    state: Mutex<State<Key, Value, Error>>,
}

impl<Key, Value, Error, Batcher> Core<Key, Value, Error, Batcher> {
    /// Take the pending queue, starting a new generation. If `generation`
    /// is given and has already ended, nothing is taken.
    fn take_queue(&self, generation: Option<u64>) -> Queue<Key, Value, Error> {
        let mut state = self.state.lock();

        match generation {
            Some(generation) if generation != state.generation => Vec::new(),
            _ => {
                state.scheduled = false;
                state.generation = state.generation.wrapping_add(1);
                mem::take(&mut state.queue)
            }
        }
    }
}

impl<Key: Eq + Hash, Value, Error, Batcher> Core<Key, Value, Error, Batcher> {
    /// Remove cache entries, but only the ones that still hold the given
    /// cells; a key that was cleared and reloaded keeps its new cell.
    fn evict(&self, cache_keys: &[Key], cells: &[Cell<Value, Error>]) {
        if !self.options.caching {
            return;
        }

        let mut state = self.state.lock();
        for (key, cell) in cache_keys.iter().zip(cells) {
            if state
                .cache
                .get(key)
                .is_some_and(|cached| ResultCell::ptr_eq(cached, cell))
            {
                state.cache.remove(key);
            }
        }
    }
}

/// One call to the batch function, for one chunk of the queue (or a single
/// key, when batching is disabled). The batch function is called on the
/// first poll.
///
/// Until the call completes, a `Dispatch` owns its cells. If it's dropped
/// before then, the cells fail with [`LoadError::Cancelled`] and are evicted,
/// so that their keys can be loaded again.
struct Dispatch<Key: Eq + Hash, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    core: Arc<Core<Key, Value, Error, Batcher>>,

    // Moved into the batch function on the first poll
    keys: Vec<Key>,

    // Empty when caching is disabled
    cache_keys: Vec<Key>,

    // Empty once every cell has been resolved
    cells: Vec<Cell<Value, Error>>,

    // If true, this is an unbatched load of a single key, and extra values
    // are ignored.
    single: bool,

    call: Option<Pin<Box<Batcher::Future>>>,
}

impl<Key, Value, Error, Batcher> Dispatch<Key, Value, Error, Batcher>
where
    Key: Eq + Hash + Clone,
    Batcher: BatchFn<Key, Value, Error>,
{
    fn new(
        core: Arc<Core<Key, Value, Error, Batcher>>,
        chunk: Queue<Key, Value, Error>,
        single: bool,
    ) -> Self {
        let (keys, cells): (Vec<Key>, Vec<Cell<Value, Error>>) = chunk.into_iter().unzip();
        let cache_keys = if core.options.caching {
            keys.iter()
                .map(|key| core.options.cache_key_for(key))
                .collect()
        } else {
            Vec::new()
        };

        Self {
            core,
            keys,
            cache_keys,
            cells,
            single,
            call: None,
        }
    }
}

impl<Key, Value, Error, Batcher> Dispatch<Key, Value, Error, Batcher>
where
    Key: Eq + Hash,
    Error: Clone,
    Batcher: BatchFn<Key, Value, Error>,
{
    /// Distribute the outcome of the batch call to the cells.
    fn finish(&mut self, outcome: Result<Vec<Result<Value, Error>>, Error>) {
        let cells = mem::take(&mut self.cells);
        let count = cells.len();

        let error = match outcome {
            Ok(outcomes) if self.single => match outcomes.into_iter().next() {
                Some(outcome) => {
                    if let Some(cell) = cells.first() {
                        cell.resolve(outcome.map_err(LoadError::Key));
                    }
                    return;
                }
                None => {
                    tracing::warn!("batch function returned no value for a single key");
                    LoadError::MissingValue
                }
            },
            Ok(outcomes) if outcomes.len() == count => {
                cells
                    .iter()
                    .zip(outcomes)
                    .for_each(|(cell, outcome)| {
                        cell.resolve(outcome.map_err(LoadError::Key));
                    });
                return;
            }
            Ok(outcomes) => {
                tracing::warn!(
                    keys = count,
                    values = outcomes.len(),
                    "batch function returned the wrong number of values"
                );
                LoadError::LengthMismatch {
                    keys: count,
                    values: outcomes.len(),
                }
            }
            Err(err) => {
                tracing::warn!(keys = count, "batch function failed");
                LoadError::Batch(err)
            }
        };

        // Evict first, so that a woken waiter retrying the load gets a fresh
        // call instead of this error.
        self.core.evict(&self.cache_keys, &cells);
        cells.iter().for_each(|cell| {
            cell.resolve_err(error.clone());
        });
    }
}

impl<Key, Value, Error, Batcher> Future for Dispatch<Key, Value, Error, Batcher>
where
    Key: Eq + Hash,
    Error: Clone,
    Batcher: BatchFn<Key, Value, Error>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        let this = Pin::into_inner(self);

        if this.cells.is_empty() {
            return Poll::Ready(());
        }

        if this.call.is_none() {
            let keys = mem::take(&mut this.keys);
            this.call = Some(Box::pin(this.core.batcher.load(keys)));
        }

        let outcome = match this.call.as_mut() {
            Some(call) => ready!(call.as_mut().poll(ctx)),
            None => return Poll::Ready(()),
        };

        this.call = None;
        this.finish(outcome);
        Poll::Ready(())
    }
}

// The batch call is boxed, and nothing else is structurally pinned.
impl<Key, Value, Error, Batcher> Unpin for Dispatch<Key, Value, Error, Batcher>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key, Value, Error>,
{
}

impl<Key, Value, Error, Batcher> Drop for Dispatch<Key, Value, Error, Batcher>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key, Value, Error>,
{
    fn drop(&mut self) {
        if self.cells.is_empty() {
            return;
        }

        tracing::debug!(keys = self.cells.len(), "batch dropped before it completed");

        let cells = mem::take(&mut self.cells);
        self.core.evict(&self.cache_keys, &cells);
        cells.iter().for_each(|cell| {
            cell.resolve_err(LoadError::Cancelled);
        });
    }
}

/// The future returned by [`Loader::execute`]. Calls the batch function for
/// each chunk of the queue it took, concurrently, and completes once every
/// one of those loads has its result.
///
/// Dropping an `Execution` before it completes fails its unfinished loads
/// with [`LoadError::Cancelled`] and removes them from the cache.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Execution<Key: Eq + Hash, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    dispatches: Vec<Dispatch<Key, Value, Error, Batcher>>,
}

impl<Key, Value, Error, Batcher> Execution<Key, Value, Error, Batcher>
where
    Key: Eq + Hash + Clone,
    Batcher: BatchFn<Key, Value, Error>,
{
    fn new(core: &Arc<Core<Key, Value, Error, Batcher>>, generation: Option<u64>) -> Self {
        let queue = core.take_queue(generation);
        if queue.is_empty() {
            return Self {
                dispatches: Vec::new(),
            };
        }

        let keys = queue.len();
        let dispatches: Vec<_> = batch::chunks(queue, core.options.max_batch_size)
            .into_iter()
            .map(|chunk| Dispatch::new(core.clone(), chunk, false))
            .collect();

        tracing::debug!(keys, batches = dispatches.len(), "executing queued loads");
        Self { dispatches }
    }

    fn single(
        core: Arc<Core<Key, Value, Error, Batcher>>,
        key: Key,
        cell: Cell<Value, Error>,
    ) -> Self {
        Self {
            dispatches: vec![Dispatch::new(core, vec![(key, cell)], true)],
        }
    }
}

impl<Key, Value, Error, Batcher> Future for Execution<Key, Value, Error, Batcher>
where
    Key: Eq + Hash,
    Error: Clone,
    Batcher: BatchFn<Key, Value, Error>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        let this = Pin::into_inner(self);

        this.dispatches
            .retain_mut(|dispatch| Pin::new(dispatch).poll(ctx).is_pending());

        if this.dispatches.is_empty() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl<Key, Value, Error, Batcher> Unpin for Execution<Key, Value, Error, Batcher>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key, Value, Error>,
{
}

impl<Key, Value, Error, Batcher> Debug for Execution<Key, Value, Error, Batcher>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key, Value, Error>,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("batches", &self.dispatches.len())
            .finish()
    }
}

/// Work that a [`Loader`] hands to its spawner: either an execution of the
/// queue after the [`execution_period`][LoaderOptions::execution_period], or
/// a single unbatched load.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct BackgroundTask<Key: Eq + Hash, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    stage: Stage<Key, Value, Error, Batcher>,
}

enum Stage<Key: Eq + Hash, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    Scheduled {
        delay: Delay,
        core: Arc<Core<Key, Value, Error, Batcher>>,
        generation: u64,
    },
    Running(Execution<Key, Value, Error, Batcher>),
}

impl<Key, Value, Error, Batcher> Future for BackgroundTask<Key, Value, Error, Batcher>
where
    Key: Eq + Hash + Clone,
    Error: Clone,
    Batcher: BatchFn<Key, Value, Error>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        let this = Pin::into_inner(self);

        loop {
            let execution = match &mut this.stage {
                Stage::Scheduled {
                    delay,
                    core,
                    generation,
                } => {
                    ready!(Pin::new(delay).poll(ctx));

                    // Takes nothing if the queue was executed manually in the
                    // meantime.
                    Execution::new(core, Some(*generation))
                }
                Stage::Running(execution) => return Pin::new(execution).poll(ctx),
            };

            this.stage = Stage::Running(execution);
        }
    }
}

impl<Key, Value, Error, Batcher> Unpin for BackgroundTask<Key, Value, Error, Batcher>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key, Value, Error>,
{
}

impl<Key, Value, Error, Batcher> Debug for BackgroundTask<Key, Value, Error, Batcher>
where
    Key: Eq + Hash,
    Batcher: BatchFn<Key, Value, Error>,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Stage::Scheduled { generation, .. } => f
                .debug_struct("BackgroundTask")
                .field("scheduled", generation)
                .finish(),
            Stage::Running(execution) => f
                .debug_struct("BackgroundTask")
                .field("running", execution)
                .finish(),
        }
    }
}

/// A Loader collects individual key loads into batches, calls the batch
/// function once per batch, and distributes the results back to each
/// individual load. Results are memoized per key for as long as the loader
/// lives, so a loader should be scoped to a single unit of work, such as one
/// request.
///
/// Loaders are cheap to clone; clones share the same cache and queue.
///
/// Background work (automatic execution after
/// [`execution_period`][LoaderOptions::execution_period], and unbatched
/// loads) is spawned onto the `Spawner`; see [`SpawnTask`].
pub struct Loader<Key, Value, Error, Batcher, Spawner> {
    core: Arc<Core<Key, Value, Error, Batcher>>,
    spawner: Spawner,
}

impl<Key, Value, Error, Batcher, Spawner> Loader<Key, Value, Error, Batcher, Spawner> {
    /// Create a loader with the default options: batching and caching are
    /// enabled, there's no maximum batch size, and batches are only executed
    /// when [`execute`][Loader::execute] is called.
    pub fn new(batcher: Batcher, spawner: Spawner) -> Self {
        Self::with_options(batcher, spawner, LoaderOptions::default())
    }

    pub fn with_options(batcher: Batcher, spawner: Spawner, options: LoaderOptions<Key>) -> Self {
        Self {
            core: Arc::new(Core {
                batcher,
                options,
                state: Mutex::new(State {
                    cache: HashMap::new(),
                    queue: Vec::new(),
                    scheduled: false,
                    generation: 0,
                }),
            }),
            spawner,
        }
    }

    pub fn options(&self) -> &LoaderOptions<Key> {
        &self.core.options
    }

    /// The number of loads waiting for the next [`execute`][Loader::execute].
    pub fn queued(&self) -> usize {
        self.core.state.lock().queue.len()
    }

    /// The number of keys in the cache.
    pub fn cached(&self) -> usize {
        self.core.state.lock().cache.len()
    }

    /// Empty the cache. Loads that are already in flight still complete.
    pub fn clear_all(&self) -> &Self {
        self.core.state.lock().cache.clear();
        self
    }
}

impl<Key, Value, Error, Batcher, Spawner> Loader<Key, Value, Error, Batcher, Spawner>
where
    Key: Eq + Hash + Clone,
{
    /// Remove a key from the cache, so that the next load of it calls the
    /// batch function again. Loads of the key that are already in flight
    /// still complete.
    pub fn clear(&self, key: &Key) -> &Self {
        let cache_key = self.core.options.cache_key_for(key);
        self.core.state.lock().cache.remove(&cache_key);
        self
    }

    /// Put a value in the cache, if the key isn't already cached. Existing
    /// entries, including failed ones, are never replaced; to force a value,
    /// [`clear`][Loader::clear] the key first. Does nothing if caching is
    /// disabled.
    pub fn prime(&self, key: Key, value: Value) -> &Self {
        if !self.core.options.caching {
            return self;
        }

        let cache_key = self.core.options.cache_key_for(&key);
        self.core
            .state
            .lock()
            .cache
            .entry(cache_key)
            .or_insert_with(move || ResultCell::resolved(Ok(value)));
        self
    }
}

impl<Key, Value, Error, Batcher, Spawner> Loader<Key, Value, Error, Batcher, Spawner>
where
    Key: Eq + Hash + Clone,
    Batcher: BatchFn<Key, Value, Error>,
{
    /// Execute everything in the queue. The queue is taken immediately, when
    /// this method is called; keys loaded after that go into a new queue.
    /// The returned future calls the batch function (once per
    /// [`max_batch_size`][LoaderOptions::max_batch_size] chunk) and completes
    /// once every queued load has its result.
    ///
    /// Failures are delivered to the affected loads; the future itself
    /// always succeeds. If it's dropped before it completes, the loads it
    /// took fail with [`LoadError::Cancelled`].
    pub fn execute(&self) -> Execution<Key, Value, Error, Batcher> {
        Execution::new(&self.core, None)
    }
}

impl<Key, Value, Error, Batcher, Spawner> Loader<Key, Value, Error, Batcher, Spawner>
where
    Key: Eq + Hash + Clone,
    Batcher: BatchFn<Key, Value, Error>,
    Spawner: SpawnTask<BackgroundTask<Key, Value, Error, Batcher>>,
{
    /// Load a single key.
    ///
    /// If the key is cached, the returned future waits on the cached result;
    /// every load of the same key shares that one result. Otherwise, the key
    /// is added to the queue for the next batch (or, with batching disabled,
    /// loaded right away in the background).
    ///
    /// This method never blocks. Note that, unless an
    /// [`execution_period`][LoaderOptions::execution_period] is configured,
    /// the returned future won't complete until [`execute`][Loader::execute]
    /// is called.
    pub fn load(&self, key: Key) -> LoadFuture<Value, Error> {
        let options = &self.core.options;
        let cache_key = if options.caching {
            Some(options.cache_key_for(&key))
        } else {
            None
        };

        let (cell, then) = {
            let mut state = self.core.state.lock();

            if let Some(cache_key) = &cache_key {
                if let Some(cached) = state.cache.get(cache_key) {
                    tracing::trace!("load served from cache");
                    return cached.wait();
                }
            }

            let cell = ResultCell::new();
            if let Some(cache_key) = cache_key {
                state.cache.insert(cache_key, cell.clone());
            }

            let then = if !options.batching {
                Then::Spawn(key)
            } else {
                state.queue.push((key, cell.clone()));
                match options.execution_period {
                    Some(period) if !state.scheduled => {
                        state.scheduled = true;
                        Then::Schedule {
                            period,
                            generation: state.generation,
                        }
                    }
                    _ => Then::Queued,
                }
            };

            (cell, then)
        };

        tracing::trace!(batching = options.batching, "load missed cache");

        match then {
            Then::Queued => {}
            Then::Schedule { period, generation } => self.schedule(period, generation),
            Then::Spawn(key) => self.spawn_one(key, cell.clone()),
        }

        cell.wait()
    }

    /// Load several keys. The keys are all loaded as if by
    /// [`load`][Loader::load], and the future completes with their values in
    /// the same order, or with the first error.
    pub fn load_many(
        &self,
        keys: impl IntoIterator<Item = Key>,
    ) -> TryJoinAll<LoadFuture<Value, Error>>
    where
        Value: Clone,
        Error: Clone,
    {
        future::try_join_all(keys.into_iter().map(|key| self.load(key)))
    }

    fn schedule(&self, period: Duration, generation: u64) {
        // The timer starts now, not when the executor first polls the task.
        let task = BackgroundTask {
            stage: Stage::Scheduled {
                delay: Delay::new(period),
                core: self.core.clone(),
                generation,
            },
        };

        match self.spawner.spawn_task(task) {
            Ok(()) => tracing::debug!(?period, generation, "scheduled batch execution"),
            Err(err) => {
                tracing::warn!(error = %err, "failed to schedule batch execution");

                // Let the next load try again.
                let mut state = self.core.state.lock();
                if state.generation == generation {
                    state.scheduled = false;
                }
            }
        }
    }

    fn spawn_one(&self, key: Key, cell: Cell<Value, Error>) {
        let task = BackgroundTask {
            stage: Stage::Running(Execution::single(self.core.clone(), key, cell)),
        };

        // A refused task has already been dropped, which cancelled its load.
        if let Err(err) = self.spawner.spawn_task(task) {
            tracing::warn!(error = %err, "failed to spawn batch function");
        }
    }
}

impl<Key, Value, Error, Batcher, Spawner: Clone> Clone
    for Loader<Key, Value, Error, Batcher, Spawner>
{
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            spawner: self.spawner.clone(),
        }
    }
}

impl<Key, Value, Error, Batcher, Spawner> Debug for Loader<Key, Value, Error, Batcher, Spawner> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();

        f.debug_struct("Loader")
            .field("batcher", &"<closure>")
            .field("options", &self.core.options)
            .field("cached", &state.cache.len())
            .field("queued", &state.queue.len())
            .field("scheduled", &state.scheduled)
            .finish()
    }
}
