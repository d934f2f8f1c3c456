use std::future::Future;

use futures::task::{LocalSpawn, LocalSpawnExt, Spawn, SpawnError, SpawnExt};

/// An executor that a [`Loader`][crate::Loader] can run its background work
/// on: delayed executions of the queue, and unbatched loads.
///
/// This is implemented for every [`Spawn`] executor, which requires that the
/// work is `Send`, so the keys, values, errors and batch function have to be
/// `Send` too. Loaders of non-`Send` data can run on a single-threaded
/// executor by wrapping its [`LocalSpawn`] spawner in [`Local`].
pub trait SpawnTask<Task> {
    fn spawn_task(&self, task: Task) -> Result<(), SpawnError>;
}

impl<Spawner, Task> SpawnTask<Task> for Spawner
where
    Spawner: Spawn,
    Task: Future<Output = ()> + Send + 'static,
{
    #[inline]
    fn spawn_task(&self, task: Task) -> Result<(), SpawnError> {
        self.spawn(task)
    }
}

/// Adapts a [`LocalSpawn`] executor, such as
/// [`LocalSpawner`][futures::executor::LocalSpawner], for loaders whose data
/// isn't `Send`.
///
/// ```
/// use std::rc::Rc;
/// use futures::executor::LocalPool;
/// use memoloader::{Loader, Local};
///
/// async fn shared(keys: Vec<u32>) -> Result<Vec<Result<Rc<u32>, ()>>, ()> {
///     Ok(keys.into_iter().map(|key| Ok(Rc::new(key))).collect())
/// }
///
/// let mut pool = LocalPool::new();
/// let loader: Loader<u32, Rc<u32>, (), _, _> = Loader::new(shared, Local(pool.spawner()));
///
/// let value = loader.load(7);
/// pool.run_until(loader.execute());
/// assert_eq!(*pool.run_until(value).unwrap(), 7);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Local<Spawner>(pub Spawner);

impl<Spawner, Task> SpawnTask<Task> for Local<Spawner>
where
    Spawner: LocalSpawn,
    Task: Future<Output = ()> + 'static,
{
    #[inline]
    fn spawn_task(&self, task: Task) -> Result<(), SpawnError> {
        self.0.spawn_local(task)
    }
}
