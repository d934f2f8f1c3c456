//! These tests ensure that dropped futures correctly update the shared state
use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::{
    executor::{self, LocalPool},
    future,
};
use memoloader::{Loader, LoadError, LoaderOptions, Local};
use std::{
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone, IntoWaker)]
struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {}

/// Testing async function: put a copy of each key in an Rc in the result.
/// This lets us count the copies of each result that are alive.
async fn put_keys_in_rc(keys: Vec<u32>) -> Result<Vec<Result<Rc<u32>, ()>>, ()> {
    Ok(keys.into_iter().map(|key| Ok(Rc::new(key))).collect())
}

/// Like `put_keys_in_rc`, but with values that can be sent between threads
async fn put_keys_in_arc(keys: Vec<u32>) -> Result<Vec<Result<Arc<u32>, ()>>, ()> {
    Ok(keys.into_iter().map(|key| Ok(Arc::new(key))).collect())
}

/// This test establishes a baseline behavior for our clone counters
#[test]
fn test_simple_drop_after_resolution() {
    let pool = LocalPool::new();
    let loader: Loader<u32, Rc<u32>, (), _, _> =
        Loader::new(put_keys_in_rc, Local(pool.spawner()));

    let fut1 = loader.load(1);
    let fut2 = loader.load(1);
    let fut3 = loader.load(1);
    let fut4 = loader.load(1);

    executor::block_on(loader.execute());
    let res1 = executor::block_on(fut1).unwrap();

    // At this point, the cell and our local fut1 result should both have an
    // Rc
    assert_eq!(Rc::strong_count(&res1), 2);

    // Resolving fut2 simply clones the underlying Rc
    let res2 = executor::block_on(fut2).unwrap();
    assert_eq!(Rc::strong_count(&res2), 3);

    // Dropping the other futures shouldn't change anything, because the
    // cache still holds the cell
    drop(fut3);
    drop(fut4);
    assert_eq!(Rc::strong_count(&res1), 3);

    // Clearing the key drops the last handle to the cell
    loader.clear(&1);
    assert_eq!(Rc::strong_count(&res1), 2);
}

#[test]
fn test_unbatched_local_load() {
    let mut pool = LocalPool::new();
    let loader: Loader<u32, Rc<u32>, (), _, _> = Loader::with_options(
        put_keys_in_rc,
        Local(pool.spawner()),
        LoaderOptions::default().with_batching(false),
    );

    let res = pool.run_until(loader.load(5)).unwrap();
    assert_eq!(*res, 5);
    assert_eq!(Rc::strong_count(&res), 2);
}

#[test]
fn test_drop_during_delay() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let batcher = {
        let calls = calls.clone();
        move |keys: Vec<u32>| {
            calls.lock().unwrap().push(keys.clone());
            let values: Vec<Result<u32, ()>> = keys.into_iter().map(Ok).collect();
            future::ready(Ok(values))
        }
    };

    let mut pool = LocalPool::new();
    let loader: Loader<u32, u32, (), _, _> = Loader::with_options(
        batcher,
        pool.spawner(),
        LoaderOptions::default().with_execution_period(Duration::from_millis(10)),
    );

    let waker = NoOpWaker;
    let waker = waker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1);
    let fut11 = loader.load(1);
    let fut2 = loader.load(2);
    let fut3 = loader.load(3);

    let poll = Pin::new(&mut fut1).poll(&mut ctx);
    assert_eq!(poll, Poll::Pending);
    assert_eq!(fut1.cell().waiters(), 1);

    // Dropping load futures doesn't cancel their loads; the keys are still
    // loaded and cached.
    drop(fut11);
    drop(fut3);

    assert_eq!(pool.run_until(fut1), Ok(1));
    assert_eq!(pool.run_until(fut2), Ok(2));
    assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2, 3]]);

    assert_eq!(executor::block_on(loader.load(3)), Ok(3));
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[test]
fn test_dropped_waiter_is_deregistered() {
    let pool = LocalPool::new();
    let loader: Loader<u32, Arc<u32>, (), _, _> = Loader::new(put_keys_in_arc, pool.spawner());

    let waker = NoOpWaker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1);
    let mut fut2 = loader.load(1);
    let cell = fut1.cell().clone();

    assert_eq!(Pin::new(&mut fut1).poll(&mut ctx), Poll::Pending);
    assert_eq!(Pin::new(&mut fut2).poll(&mut ctx), Poll::Pending);
    assert_eq!(cell.waiters(), 2);

    drop(fut1);
    assert_eq!(cell.waiters(), 1);

    executor::block_on(loader.execute());
    assert_eq!(executor::block_on(fut2).map(|value| *value), Ok(1));
    assert_eq!(cell.waiters(), 0);
}

#[test]
fn test_drop_during_execution() {
    let pool = LocalPool::new();
    let loader: Loader<u32, Arc<u32>, (), _, _> = Loader::new(put_keys_in_arc, pool.spawner());

    let fut1 = loader.load(1);
    let fut2 = loader.load(2);
    let execution = loader.execute();

    drop(fut1);
    executor::block_on(execution);

    // The dropped key was still loaded and cached
    assert_eq!(loader.cached(), 2);
    assert_eq!(executor::block_on(fut2).map(|value| *value), Ok(2));
    assert_eq!(executor::block_on(loader.load(1)).map(|value| *value), Ok(1));
}

#[test]
fn test_drop_while_batcher_is_running() {
    let calls = Arc::new(Mutex::new(0));
    let batcher = {
        let calls = calls.clone();
        move |_keys: Vec<u32>| {
            *calls.lock().unwrap() += 1;
            future::pending::<Result<Vec<Result<u32, ()>>, ()>>()
        }
    };

    let pool = LocalPool::new();
    let loader: Loader<u32, u32, (), _, _> = Loader::new(batcher, pool.spawner());

    let waker = NoOpWaker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1);
    let fut2 = loader.load(2);
    assert_eq!(Pin::new(&mut fut1).poll(&mut ctx), Poll::Pending);

    // This poll calls the batch function, which never completes
    let mut execution = loader.execute();
    assert_eq!(Pin::new(&mut execution).poll(&mut ctx), Poll::Pending);
    assert_eq!(*calls.lock().unwrap(), 1);

    drop(execution);

    // The waiting futures fail instead of hanging, and the keys are evicted
    assert_eq!(executor::block_on(fut1), Err(LoadError::Cancelled));
    assert_eq!(executor::block_on(fut2), Err(LoadError::Cancelled));
    assert_eq!(loader.cached(), 0);

    // So loading them again calls the batch function again
    let _retry = loader.load(1);
    assert_eq!(loader.queued(), 1);
    let mut execution = loader.execute();
    assert_eq!(Pin::new(&mut execution).poll(&mut ctx), Poll::Pending);
    assert_eq!(*calls.lock().unwrap(), 2);
}
