//! Single-shot asynchronous result carriers.
//!
//! A [`GridFuture`] moves through pending → done exactly once. Blocking
//! waiters are woken through a condvar; listeners registered before
//! completion run in the completing thread, listeners registered after
//! completion run synchronously in the registering thread. A timed-out
//! `get` leaves the future pending, so callers may retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Terminal failure of a future.
#[derive(Debug, Clone, Error)]
pub enum FutureError {
    /// The wait deadline elapsed; the future itself is still pending.
    #[error("future timed out after {0:?}")]
    Timeout(Duration),
    /// The producing operation failed.
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),
}

/// Identifies a registered completion listener for later removal.
pub type FutureListenerId = u64;

type Listener<T> = Box<dyn FnOnce(&Result<T, FutureError>) + Send>;

enum State<T> {
    Pending { listeners: Vec<(FutureListenerId, Listener<T>)> },
    Done(Result<T, FutureError>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
    next_listener: AtomicU64,
}

/// Single-consumer result carrier shared between a producer and any number
/// of waiters.
pub struct GridFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for GridFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for GridFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> GridFuture<T> {
    /// Creates a pending future.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending {
                    listeners: Vec::new(),
                }),
                done: Condvar::new(),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a future already completed with `value`.
    #[must_use]
    pub fn completed(value: T) -> Self {
        let fut = Self::new();
        fut.complete(value);
        fut
    }

    /// Completes the future. Only the first completion wins; later calls
    /// return `false` and leave the stored result untouched.
    pub fn complete(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    /// Fails the future with an error cause.
    pub fn fail<E>(&self, err: E) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.finish(Err(FutureError::Failed(Arc::new(err))))
    }

    /// Whether a result has been stored.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    /// Blocks until the future completes and returns the result.
    pub fn get(&self) -> Result<T, FutureError> {
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return result.clone();
            }
            self.inner.done.wait(&mut state);
        }
    }

    /// Blocks up to `timeout`. On expiry returns [`FutureError::Timeout`]
    /// and the future remains pending.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, FutureError> {
        let mut state = self.inner.state.lock();
        if let State::Done(result) = &*state {
            return result.clone();
        }
        let timed_out = self.inner.done.wait_for(&mut state, timeout).timed_out();
        match &*state {
            State::Done(result) => result.clone(),
            State::Pending { .. } => {
                debug_assert!(timed_out);
                Err(FutureError::Timeout(timeout))
            }
        }
    }

    /// Registers a completion listener. Returns an id usable with
    /// [`Self::stop_listen`]. If the future is already done the listener
    /// runs before this call returns.
    pub fn listen<F>(&self, listener: F) -> FutureListenerId
    where
        F: FnOnce(&Result<T, FutureError>) + Send + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut pending = Some(listener);
        let done = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending { listeners } => {
                    if let Some(listener) = pending.take() {
                        listeners.push((id, Box::new(listener)));
                    }
                    None
                }
                State::Done(result) => Some(result.clone()),
            }
        };
        if let (Some(result), Some(listener)) = (done, pending.take()) {
            listener(&result);
        }
        id
    }

    /// Removes a listener registered before completion. Returns whether it
    /// was still pending.
    pub fn stop_listen(&self, id: FutureListenerId) -> bool {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Pending { listeners } => {
                let before = listeners.len();
                listeners.retain(|(listener_id, _)| *listener_id != id);
                listeners.len() != before
            }
            State::Done(_) => false,
        }
    }

    fn finish(&self, result: Result<T, FutureError>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending { listeners } => {
                    let taken = std::mem::take(listeners);
                    *state = State::Done(result.clone());
                    self.inner.done.notify_all();
                    taken
                }
            }
        };
        for (_, listener) in listeners {
            listener(&result);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn first_completion_wins() {
        let fut = GridFuture::new();
        assert!(fut.complete(7_u64));
        assert!(!fut.complete(8));
        assert!(!fut.fail(io::Error::other("late")));
        assert_eq!(fut.get().expect("done"), 7);
    }

    #[test]
    fn timed_out_get_leaves_future_pending() {
        let fut: GridFuture<u64> = GridFuture::new();
        let err = fut.get_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, FutureError::Timeout(_)));
        assert!(!fut.is_done());

        fut.complete(1);
        assert_eq!(fut.get_timeout(Duration::from_millis(10)).expect("done"), 1);
    }

    #[test]
    fn blocked_waiter_is_woken_by_completion() {
        let fut: GridFuture<u64> = GridFuture::new();
        let waiter = {
            let fut = fut.clone();
            std::thread::spawn(move || fut.get())
        };
        std::thread::sleep(Duration::from_millis(20));
        fut.complete(42);
        assert_eq!(waiter.join().expect("join").expect("done"), 42);
    }

    #[test]
    fn listener_added_before_completion_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fut: GridFuture<u64> = GridFuture::new();
        let counter = Arc::clone(&fired);
        fut.listen(move |result| {
            assert!(result.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        fut.complete(5);
        fut.complete(6);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_added_after_completion_runs_synchronously() {
        let fut = GridFuture::completed(3_u64);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        fut.listen(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_does_not_fire() {
        let fut: GridFuture<u64> = GridFuture::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let id = fut.listen(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(fut.stop_listen(id));
        fut.complete(1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failure_propagates_cause() {
        let fut: GridFuture<u64> = GridFuture::new();
        fut.fail(io::Error::other("transport gone"));
        let err = fut.get().unwrap_err();
        assert!(err.to_string().contains("transport gone"));
    }
}
