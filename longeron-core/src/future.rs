//! Write-once asynchronous results.
//!
//! A [`Promise`] is the producer side, a [`Future`] the consumer side of
//! one completion cell with states pending → success / failure /
//! cancelled (terminal). Listeners registered before completion fire
//! exactly once, in registration order, on the promise's designated
//! executor. Listeners registered after completion are scheduled on that
//! executor as well; they only run inline when the promise has no
//! executor at all. Completion attempts after the first are no-ops.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::error::{LongeronError, Result};
use crate::executor::EventExecutor;

/// Completion callback. Receives the completed future.
pub type Listener<T> = Box<dyn FnOnce(&Future<T>) + Send>;

enum FState<T> {
    Pending,
    Success(T),
    Failure(LongeronError),
    Cancelled,
}

struct Shared<T> {
    state: Mutex<FState<T>>,
    done: Condvar,
    listeners: Mutex<SmallVec<[Listener<T>; 2]>>,
    executor: Option<Arc<dyn EventExecutor>>,
    void: bool,
}

/// Consumer handle: inspect, wait, attach listeners, cancel.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

/// Producer handle: complete the cell.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Promise with no designated executor; listeners run on whichever
    /// thread completes or registers.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None, false)
    }

    /// Promise whose listeners are dispatched on `executor`.
    #[must_use]
    pub fn with_executor(executor: Arc<dyn EventExecutor>) -> Self {
        Self::build(Some(executor), false)
    }

    /// A promise that swallows every completion attempt and never
    /// notifies. For fire-and-forget writes where nobody listens.
    #[must_use]
    pub fn void() -> Self {
        Self::build(None, true)
    }

    fn build(executor: Option<Arc<dyn EventExecutor>>, void: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FState::Pending),
                done: Condvar::new(),
                listeners: Mutex::new(SmallVec::new()),
                executor,
                void,
            }),
        }
    }

    #[must_use]
    pub fn future(&self) -> Future<T> {
        Future {
            shared: self.shared.clone(),
        }
    }

    #[must_use]
    pub fn is_void(&self) -> bool {
        self.shared.void
    }

    /// Complete with a value. Returns `false` if already completed (or
    /// void).
    pub fn try_success(&self, value: T) -> bool {
        self.complete(FState::Success(value))
    }

    /// Complete with a failure cause. Returns `false` if already
    /// completed (or void).
    pub fn try_failure(&self, cause: LongeronError) -> bool {
        self.complete(FState::Failure(cause))
    }

    /// Move a pending promise to cancelled. Racy no-op after completion.
    pub fn cancel(&self) -> bool {
        self.complete(FState::Cancelled)
    }

    fn complete(&self, next: FState<T>) -> bool {
        if self.shared.void {
            return false;
        }
        {
            let mut state = self.shared.state.lock();
            if !matches!(*state, FState::Pending) {
                return false;
            }
            *state = next;
            self.shared.done.notify_all();
        }
        let pending: SmallVec<[Listener<T>; 2]> =
            std::mem::take(&mut *self.shared.listeners.lock());
        if !pending.is_empty() {
            let future = self.future();
            dispatch(&self.shared.executor, move || {
                for listener in pending {
                    listener(&future);
                }
            });
        }
        true
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Future<T> {
    #[must_use]
    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.state.lock(), FState::Pending)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(*self.shared.state.lock(), FState::Success(_))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.shared.state.lock(), FState::Cancelled)
    }

    /// The failure cause, if the future failed or was cancelled.
    #[must_use]
    pub fn cause(&self) -> Option<LongeronError> {
        match &*self.shared.state.lock() {
            FState::Failure(cause) => Some(cause.clone()),
            FState::Cancelled => Some(LongeronError::Cancelled),
            _ => None,
        }
    }

    /// Move a pending future to cancelled. Racy no-op after completion.
    pub fn cancel(&self) -> bool {
        Promise {
            shared: self.shared.clone(),
        }
        .cancel()
    }

    /// Attach a completion listener.
    ///
    /// Registered-before-completion listeners run in registration order.
    /// If the future is already complete the listener is scheduled on the
    /// designated executor, or runs inline when there is none.
    pub fn add_listener(&self, listener: impl FnOnce(&Future<T>) + Send + 'static) {
        {
            let state = self.shared.state.lock();
            if matches!(*state, FState::Pending) {
                self.shared.listeners.lock().push(Box::new(listener));
                return;
            }
        }
        let future = self.clone();
        dispatch(&self.shared.executor, move || listener(&future));
    }

    /// Block until done. Not legal from an event-loop thread unless
    /// already complete: a reactor waiting on itself can never finish
    /// the wait.
    pub fn await_done(&self) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }
        self.check_deadlock()?;
        let mut state = self.shared.state.lock();
        while matches!(*state, FState::Pending) {
            self.shared.done.wait(&mut state);
        }
        Ok(())
    }

    /// Bounded wait. Returns `true` when the future completed within
    /// `timeout`.
    pub fn await_timeout(&self, timeout: Duration) -> Result<bool> {
        if self.is_done() {
            return Ok(true);
        }
        self.check_deadlock()?;
        let mut state = self.shared.state.lock();
        if !matches!(*state, FState::Pending) {
            return Ok(true);
        }
        self.shared.done.wait_for(&mut state, timeout);
        Ok(!matches!(*state, FState::Pending))
    }

    /// Wait for completion and surface the failure cause, if any.
    pub fn sync(&self) -> Result<()> {
        self.await_done()?;
        match self.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    fn check_deadlock(&self) -> Result<()> {
        if let Some(executor) = &self.shared.executor {
            if executor.in_event_loop() {
                return Err(LongeronError::IllegalState(
                    "blocking wait from inside the event loop",
                ));
            }
        }
        Ok(())
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// The terminal result, if completed.
    #[must_use]
    pub fn result(&self) -> Option<Result<T>> {
        match &*self.shared.state.lock() {
            FState::Pending => None,
            FState::Success(value) => Some(Ok(value.clone())),
            FState::Failure(cause) => Some(Err(cause.clone())),
            FState::Cancelled => Some(Err(LongeronError::Cancelled)),
        }
    }

    /// Blocking get: wait, then return the value or the failure cause.
    pub fn get(&self) -> Result<T> {
        self.await_done()?;
        self.result().expect("completed future has a result")
    }
}

fn dispatch(executor: &Option<Arc<dyn EventExecutor>>, run: impl FnOnce() + Send + 'static) {
    match executor {
        Some(executor) => executor.execute(Box::new(run)),
        None => run(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_success_completes_once() {
        let promise: Promise<u32> = Promise::new();
        assert!(promise.try_success(7));
        assert!(!promise.try_success(8));
        assert!(!promise.try_failure(LongeronError::ClosedChannel));
        assert!(!promise.cancel());

        let future = promise.future();
        assert!(future.is_done());
        assert!(future.is_success());
        assert_eq!(future.get().unwrap(), 7);
    }

    #[test]
    fn test_listeners_fire_in_registration_order() {
        let promise: Promise<()> = Promise::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            promise.future().add_listener(move |_| order.lock().push(i));
        }
        promise.try_success(());
        assert_eq!(*order.lock(), vec![0, 1, 2]);

        // late listener fires immediately (no executor)
        let order2 = order.clone();
        promise.future().add_listener(move |_| order2.lock().push(9));
        assert_eq!(*order.lock(), vec![0, 1, 2, 9]);
    }

    #[test]
    fn test_cancel_then_sync() {
        let promise: Promise<()> = Promise::new();
        assert!(promise.future().cancel());
        assert!(promise.future().is_cancelled());
        assert!(matches!(
            promise.future().sync().unwrap_err(),
            LongeronError::Cancelled
        ));
    }

    #[test]
    fn test_await_timeout_expires() {
        let promise: Promise<()> = Promise::new();
        let done = promise.future().await_timeout(Duration::from_millis(20)).unwrap();
        assert!(!done);

        promise.try_failure(LongeronError::ClosedChannel);
        assert!(promise.future().await_timeout(Duration::ZERO).unwrap());
        assert!(matches!(
            promise.future().cause(),
            Some(LongeronError::ClosedChannel)
        ));
    }

    #[test]
    fn test_void_promise_swallows_everything() {
        let promise: Promise<()> = Promise::void();
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        promise
            .future()
            .add_listener(move |_| {
                observer.fetch_add(1, Ordering::SeqCst);
            });
        assert!(!promise.try_success(()));
        assert!(!promise.cancel());
        assert!(!promise.future().is_done());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cross_thread_completion() {
        let promise: Promise<u32> = Promise::new();
        let future = promise.future();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            promise.try_success(42);
        });
        assert_eq!(future.get().unwrap(), 42);
        handle.join().unwrap();
    }
}
