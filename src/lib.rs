//! Memoloader is a Rust implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader) originally
//! created by Facebook. It batches many individual key lookups into a small
//! number of batch calls, then distributes the results to each requester,
//! without the requester knowing anything about the batch operation. It also
//! memoizes each result, so that loading the same key twice only fetches it
//! once. The common use case is batching requests to an API or a database
//! during a single request of a web application.
//!
//! ## Overview
//!
//! As a simple example, suppose you had an API to fetch user data by username.
//! The API supports batching; that is, you can supply multiple usernames in
//! the same request and it will return results for all of them.
//!
//! First, adapt your API call into a batch function. A batch function takes
//! a `Vec` of keys and returns one outcome per key, in the same order. Each
//! outcome is a `Result`, so individual keys can fail without failing the
//! whole batch; if the whole batch fails, return a single error instead.
//!
//! ```
//! #[derive(Debug, Clone)]
//! struct UserData {
//!     username: String,
//!     name: String,
//! }
//!
//! #[derive(Debug, Clone)]
//! enum APIError {
//!     NotFound,
//!     Unavailable,
//! }
//!
//! async fn batch_get_users(
//!     usernames: Vec<String>,
//! ) -> Result<Vec<Result<UserData, APIError>>, APIError> {
//!     // perform the API request, then line the results up with the keys.
//!     Ok(usernames
//!         .into_iter()
//!         .map(|username| Ok(UserData { name: username.clone(), username }))
//!         .collect())
//! }
//! ```
//!
//! Once you have a batch function, create a [`Loader`]. Loaders are meant to
//! be short-lived: create one per unit of work (such as an incoming request),
//! so that its cache doesn't outlive the data it was loaded from.
//!
//! The [`Loader`] is configured with [`LoaderOptions`]:
//! - `batching` and `caching` can each be turned off.
//! - `max_batch_size` is an optional maximum number of keys per call to the
//!   batch function. Larger batches are split into several calls.
//! - `execution_period` is an optional delay after which queued keys are
//!   executed automatically. Without it, you call [`Loader::execute`]
//!   yourself once all the keys are queued.
//! - `cache_key` optionally maps each key to the key used for caching, so
//!   that equivalent keys share a result.
//!
//! The loader also needs a [spawner][futures::task::Spawn], which it uses
//! for the timer behind `execution_period` and for unbatched loads. Any
//! executor works; memoloader doesn't depend on a particular runtime. Data
//! that isn't `Send` can be loaded on a single-threaded executor, by wrapping
//! its spawner in [`Local`].
//!
//! ```
//! # #[derive(Debug, Clone)] struct UserData { username: String }
//! # #[derive(Debug, Clone)] struct APIError {}
//! # async fn batch_get_users(usernames: Vec<String>) ->
//! #     Result<Vec<Result<UserData, APIError>>, APIError> {
//! #     Ok(usernames.into_iter().map(|username| Ok(UserData { username })).collect())
//! # }
//! use futures::executor::{block_on, ThreadPool};
//! use memoloader::{Loader, LoaderOptions};
//!
//! let pool = ThreadPool::new().unwrap();
//! let loader: Loader<String, UserData, APIError, _, _> = Loader::with_options(
//!     batch_get_users,
//!     pool,
//!     LoaderOptions::default().with_max_batch_size(100),
//! );
//!
//! // `load` returns immediately, queueing the key.
//! let alice = loader.load("alice".to_string());
//! let bob = loader.load("bob".to_string());
//! // Loading a key twice shares the same result.
//! let alice_again = loader.load("alice".to_string());
//!
//! // `execute` makes a single call to the batch function for all of them.
//! block_on(loader.execute());
//!
//! assert_eq!(block_on(alice).unwrap().username, "alice");
//! assert_eq!(block_on(bob).unwrap().username, "bob");
//! assert_eq!(block_on(alice_again).unwrap().username, "alice");
//! ```
//!
//! Loaded values stay cached for the life of the loader. [`Loader::clear`]
//! and [`Loader::clear_all`] remove cached entries, and [`Loader::prime`]
//! puts a value in the cache without calling the batch function.
//!
//! ## Errors
//!
//! Loads fail with a [`LoadError`]. Errors for individual keys are only seen
//! by loads of that key, and are cached like any other result. When the batch
//! function fails as a whole, or breaks its contract by returning the wrong
//! number of values, every key in that batch fails with the same error, and
//! those keys are removed from the cache, so that loading them again retries.
//!
//! ## Design notes
//!
//! ### `ResultCell`
//!
//! Each cached key is backed by a [`ResultCell`], a single-assignment cell
//! that any number of futures can wait on. A cell is resolved at most once;
//! every future waiting on it is woken exactly once when that happens, and
//! futures that start waiting afterwards complete immediately. Since a cache
//! hit hands out a future on the very same cell, every load of a key sees
//! the identical outcome.
//!
//! Resolved outcomes are read without locking. The waiting futures are
//! tracked in a set of wakers behind a lock, and the outcome is stored while
//! that lock is held, so a future that starts waiting concurrently with the
//! resolution either sees the outcome or is woken by it.
//!
//! ### The queue
//!
//! Queued loads are kept in arrival order, and they're passed to the batch
//! function in that order. Taking the queue for execution replaces it with
//! an empty one before the batch function is called, so loads made while a
//! batch is running go into the next batch. When `execution_period` is set,
//! at most one timer runs for each generation of the queue; a timer whose
//! queue was already executed manually does nothing when it fires.
//!
//! ### Cancellation
//!
//! Clearing a key doesn't cancel its in-flight load; futures already waiting
//! on it still get the result. Dropping a load future doesn't cancel the load
//! either. There are no timeouts: if the batch function never completes,
//! neither do its loads.
//!
//! The one thing that does cancel loads is dropping the future returned by
//! [`Loader::execute`] before it completes. Since the queue was already taken,
//! its unfinished loads fail with [`LoadError::Cancelled`] and are removed
//! from the cache, so that loading those keys again calls the batch function.

mod batch;
mod cell;
mod error;
mod loader;
mod options;
mod spawn;
mod wakerset;

pub use batch::BatchFn;
pub use cell::{ResultCell, Wait};
pub use error::LoadError;
pub use loader::{BackgroundTask, Execution, LoadFuture, Loader};
pub use options::{CacheKeyFn, LoaderOptions};
pub use spawn::{Local, SpawnTask};
