//! Helpers for testing the resource cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test.
//!
//!  - This crate does not depend on `revalidator`, so that the unit tests of that crate can
//!    use it. Wrap the helpers in a `resolver_fn` to get a resolver.
//!
//!  - Latency in tests should come from `tokio::time::sleep` in combination with a paused
//!    clock (`#[tokio::test(start_paused = true)]`), never from real waiting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `revalidator` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("revalidator=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Counts calls, e.g. of a resolver.
///
/// Clones share the same count.
#[derive(Clone, Debug, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call and returns its zero-based index.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// The number of recorded calls.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A scripted sequence of responses.
///
/// Every call to [`next`](Self::next) hands out the next response in order, the last one
/// is repeated once the script is exhausted. Clones share the same script.
#[derive(Debug)]
pub struct Responses<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Clone for Responses<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Responses<T> {
    /// Creates a script from the given responses.
    ///
    /// # Panics
    ///
    /// Panics if `responses` is empty.
    pub fn new(responses: impl IntoIterator<Item = T>) -> Self {
        let responses: VecDeque<_> = responses.into_iter().collect();
        assert!(!responses.is_empty(), "a script needs at least one response");
        Self {
            inner: Arc::new(Mutex::new(responses)),
        }
    }

    /// Takes the next response.
    pub fn next(&self) -> T {
        let mut responses = self.inner.lock().unwrap();
        if responses.len() > 1 {
            responses.pop_front().unwrap()
        } else {
            responses[0].clone()
        }
    }

    /// Replaces the remaining script with a single, repeating response.
    pub fn set(&self, response: T) {
        let mut responses = self.inner.lock().unwrap();
        responses.clear();
        responses.push_back(response);
    }

    /// Appends a response to the script.
    pub fn push(&self, response: T) {
        self.inner.lock().unwrap().push_back(response);
    }
}

/// A gate that holds back callers until the test lets them pass.
///
/// Each [`release`](Self::release)d permit lets exactly one waiting or future
/// [`pass`](Self::pass) through. Clones share the same gate.
#[derive(Clone, Debug)]
pub struct Gate {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits until a permit is released.
    ///
    /// A caller that is dropped while waiting, e.g. because its task was aborted, stops
    /// counting as waiting.
    pub async fn pass(&self) {
        struct Waiting<'a>(&'a AtomicUsize);
        impl Drop for Waiting<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }

        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = Waiting(&self.waiting);
        let permit = self.permits.acquire().await.unwrap();
        permit.forget();
    }

    /// Lets `n` callers pass.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// The number of callers currently held back.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}
