//! These tests ensure that waiting futures are notified exactly when their
//! results become available.

use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::{
    executor::{LocalPool, ThreadPool},
    FutureExt,
};
use memoloader::{Loader, LoaderOptions, ResultCell};
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
    thread::sleep,
    time::Duration,
};

/// A waker that stores true if it has been awoken
#[derive(Debug, Clone, Default, IntoWaker)]
struct BoolWaker {
    cell: Arc<AtomicBool>,
}

impl BoolWaker {
    fn reset(&self) {
        self.cell.store(false, Ordering::SeqCst)
    }

    fn is_signaled(&self) -> bool {
        self.cell.load(Ordering::SeqCst)
    }
}

impl WakeRef for BoolWaker {
    fn wake_by_ref(&self) {
        self.cell.store(true, Ordering::SeqCst)
    }
}

impl Wake for BoolWaker {}

/// A future that returns pending the first N times it is polled, then
/// returns Ready. It immediately calls Wake when it's polled in the pending
/// state, so that the batch function can be stepped through manually.
#[derive(Debug, Clone)]
struct Skipper {
    remaining_skips: usize,
}

impl Skipper {
    fn new(count: usize) -> Self {
        Skipper {
            remaining_skips: count,
        }
    }
}

impl Future for Skipper {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.get_mut().remaining_skips {
            0 => Poll::Ready(()),
            skips => {
                *skips -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

struct Task<F: Future + Unpin> {
    fut: F,
    signal: BoolWaker,
    waker: Waker,
}

impl<F: Future + Unpin> Task<F> {
    fn new(fut: F) -> Self {
        let signal = BoolWaker::default();

        Task {
            fut,
            waker: signal.clone().into_waker(),
            signal,
        }
    }

    fn poll(&mut self) -> Poll<F::Output> {
        self.signal.reset();
        self.fut.poll_unpin(&mut Context::from_waker(&self.waker))
    }

    fn is_signaled(&self) -> bool {
        self.signal.is_signaled()
    }
}

async fn skip_once(keys: Vec<i32>) -> Result<Vec<Result<i32, ()>>, ()> {
    Skipper::new(1).await;
    Ok(keys.into_iter().map(Ok).collect())
}

#[test]
fn test_notify_lifecycle() {
    let pool = LocalPool::new();
    let loader: Loader<i32, i32, (), _, _> = Loader::new(skip_once, pool.spawner());

    let mut task1 = Task::new(loader.load(1));
    let mut task2 = Task::new(loader.load(2));
    let mut task3 = Task::new(loader.load(3));

    assert_eq!(task3.poll(), Poll::Pending);
    assert_eq!(task2.poll(), Poll::Pending);
    assert_eq!(task1.poll(), Poll::Pending);

    // Nothing happens until the queue is executed
    assert!(!task1.is_signaled());
    assert!(!task2.is_signaled());
    assert!(!task3.is_signaled());

    let mut execution = Task::new(Box::pin(loader.execute()));

    // The first poll of the execution reaches the Skipper, which notifies
    // only the execution itself.
    assert_eq!(execution.poll(), Poll::Pending);

    assert!(execution.is_signaled());
    assert!(!task1.is_signaled());
    assert!(!task2.is_signaled());
    assert!(!task3.is_signaled());

    // The second poll finishes the batch, which should notify ALL the loads
    assert_eq!(execution.poll(), Poll::Ready(()));

    assert!(task1.is_signaled());
    assert!(task2.is_signaled());
    assert!(task3.is_signaled());

    assert_eq!(task1.poll(), Poll::Ready(Ok(1)));
    assert_eq!(task2.poll(), Poll::Ready(Ok(2)));
    assert_eq!(task3.poll(), Poll::Ready(Ok(3)));
}

#[test]
fn test_late_waiter_is_ready() {
    let pool = LocalPool::new();
    let loader: Loader<i32, i32, (), _, _> = Loader::new(skip_once, pool.spawner());

    let mut early = Task::new(loader.load(1));
    assert_eq!(early.poll(), Poll::Pending);

    let mut execution = Task::new(Box::pin(loader.execute()));
    while execution.poll().is_pending() {}

    // A waiter that arrives after resolution is ready on its first poll, and
    // never needs to be woken
    let mut late = Task::new(loader.load(1));
    assert_eq!(late.poll(), Poll::Ready(Ok(1)));
    assert!(!late.is_signaled());

    assert!(early.is_signaled());
    assert_eq!(early.poll(), Poll::Ready(Ok(1)));
}

#[test]
fn test_concurrent_callers_share_a_cell() {
    let pool = LocalPool::new();
    let loader: Loader<i32, i32, (), _, _> = Loader::new(skip_once, pool.spawner());

    let mut tasks: HashMap<usize, _> = (0..5).map(|i| (i, Task::new(loader.load(7)))).collect();

    for task in tasks.values_mut() {
        assert_eq!(task.poll(), Poll::Pending);
    }

    let cell = tasks[&0].fut.cell().clone();
    assert!(tasks
        .values()
        .all(|task| ResultCell::ptr_eq(task.fut.cell(), &cell)));
    assert_eq!(cell.waiters(), 5);

    // Dropping a waiter shouldn't notify any of the others
    tasks.remove(&4);
    assert_eq!(cell.waiters(), 4);
    assert!(tasks.values().all(|task| !task.is_signaled()));

    let mut execution = Task::new(Box::pin(loader.execute()));
    while execution.poll().is_pending() {}

    assert!(tasks.values().all(|task| task.is_signaled()));
    for task in tasks.values_mut() {
        assert_eq!(task.poll(), Poll::Ready(Ok(7)));
    }
}

#[test]
fn test_notify_after_period() {
    let pool = ThreadPool::new().unwrap();
    let loader: Loader<i32, i32, (), _, _> = Loader::with_options(
        skip_once,
        pool,
        LoaderOptions::default().with_execution_period(Duration::from_millis(1)),
    );

    let mut tasks: Vec<_> = (1..=3).map(|key| Task::new(loader.load(key))).collect();

    for task in &mut tasks {
        assert_eq!(task.poll(), Poll::Pending);
    }

    // The timer and the batch both run on the pool. After they're done,
    // every task should have been signaled.
    sleep(Duration::from_millis(100));

    assert!(tasks.iter().all(|task| task.is_signaled()));
    for (task, key) in tasks.iter_mut().zip(1..) {
        assert_eq!(task.poll(), Poll::Ready(Ok(key)));
    }
}
