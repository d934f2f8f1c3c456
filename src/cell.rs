//! A single-assignment cell that any number of tasks can wait on.

use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::wakerset::{Token as WakerToken, WakerSet};

struct Shared<T, E> {
    // Invariant: only ever stored while `wakers` is locked, and only once.
    // Reads don't need the lock; once this is Some it never changes again.
    outcome: ArcSwapOption<Result<T, E>>,
    wakers: Mutex<WakerSet>,
}

/// A cell holding the eventual outcome of a single load. It starts out
/// unset, and is resolved at most once with either a value or an error;
/// every later attempt to resolve it is ignored.
///
/// `ResultCell` is a handle: clones refer to the same underlying cell. Use
/// [`ResultCell::wait`] to get a future that completes with (a clone of) the
/// outcome once it's available.
pub struct ResultCell<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> ResultCell<T, E> {
    /// Create a new, unset cell.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                outcome: ArcSwapOption::const_empty(),
                wakers: Mutex::new(WakerSet::default()),
            }),
        }
    }

    /// Create a cell that is already resolved with `outcome`.
    pub fn resolved(outcome: Result<T, E>) -> Self {
        Self {
            shared: Arc::new(Shared {
                outcome: ArcSwapOption::from_pointee(outcome),
                wakers: Mutex::new(WakerSet::default()),
            }),
        }
    }

    /// Resolve this cell with `outcome`, waking every waiting task. Returns
    /// true if this call resolved the cell, or false if it was already
    /// resolved, in which case `outcome` is discarded.
    pub fn resolve(&self, outcome: Result<T, E>) -> bool {
        let wakers = {
            let mut wakers = self.shared.wakers.lock();
            if self.shared.outcome.load().is_some() {
                return false;
            }

            self.shared.outcome.store(Some(Arc::new(outcome)));
            mem::take(&mut *wakers)
        };

        // Any waiter that locks after us sees the outcome, so the set we took
        // is complete. Wake outside the lock.
        wakers.wake_all();
        true
    }

    /// Resolve this cell with a value. See [`resolve`][ResultCell::resolve].
    #[inline]
    pub fn resolve_ok(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Resolve this cell with an error. See [`resolve`][ResultCell::resolve].
    #[inline]
    pub fn resolve_err(&self, error: E) -> bool {
        self.resolve(Err(error))
    }

    /// Check if this cell has been resolved.
    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.shared.outcome.load().is_some()
    }

    /// The number of tasks currently waiting on this cell.
    pub fn waiters(&self) -> usize {
        self.shared.wakers.lock().len()
    }

    /// Check if two handles refer to the same cell.
    #[inline]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.shared, &other.shared)
    }

    /// Get a future that completes with this cell's outcome.
    pub fn wait(&self) -> Wait<T, E> {
        Wait {
            cell: self.clone(),
            waker_token: None,
        }
    }
}

impl<T: Clone, E: Clone> ResultCell<T, E> {
    /// Get a copy of the outcome, if the cell has been resolved.
    pub fn get(&self) -> Option<Result<T, E>> {
        let outcome = self.shared.outcome.load();
        (*outcome).as_deref().cloned()
    }
}

impl<T, E> Default for ResultCell<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for ResultCell<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Debug, E: Debug> Debug for ResultCell<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let outcome = self.shared.outcome.load();
        f.debug_struct("ResultCell")
            .field("outcome", &(*outcome).as_deref())
            .finish()
    }
}

/// Future returned by [`ResultCell::wait`]. Resolves to a clone of the
/// cell's outcome.
///
/// Each `Wait` registers its own waker with the cell, so any number of them
/// can be pending at once; all of them are woken when the cell is resolved.
/// Dropping a pending `Wait` deregisters it.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Wait<T, E> {
    cell: ResultCell<T, E>,
    waker_token: Option<WakerToken>,
}

impl<T, E> Wait<T, E> {
    /// The cell this future is waiting on.
    pub fn cell(&self) -> &ResultCell<T, E> {
        &self.cell
    }
}

impl<T: Debug, E: Debug> Debug for Wait<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("cell", &self.cell)
            .field("registered", &self.waker_token.is_some())
            .finish()
    }
}

impl<T: Clone, E: Clone> Future for Wait<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        // Fast path: resolved cells are read without locking.
        if let Some(outcome) = this.cell.get() {
            this.waker_token = None;
            return Poll::Ready(outcome);
        }

        let mut wakers = this.cell.shared.wakers.lock();

        // The outcome may have been stored between the check above and
        // taking the lock. Once we hold the lock it can't change.
        if let Some(outcome) = this.cell.get() {
            drop(wakers);
            this.waker_token = None;
            return Poll::Ready(outcome);
        }

        match this.waker_token.as_ref() {
            Some(token) => wakers.replace_waker(token, ctx.waker()),
            None => this.waker_token = Some(wakers.add_waker(ctx.waker().clone())),
        }

        Poll::Pending
    }
}

impl<T, E> Drop for Wait<T, E> {
    fn drop(&mut self) {
        if let Some(token) = self.waker_token.take() {
            // If the cell was resolved, this token belonged to a set that has
            // already been woken and discarded; removing it is a no-op.
            self.cell.shared.wakers.lock().discard_waker(token);
        }
    }
}
