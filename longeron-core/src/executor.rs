//! Event executors.
//!
//! An event executor owns exactly one worker thread with a stable name.
//! Tasks submitted with [`EventExecutor::execute`] run on that thread in
//! FIFO order; [`EventExecutor::schedule`] adds a delay. `in_event_loop`
//! tests caller affinity, which is what the pipeline uses to decide
//! between invoking a handler directly and hopping executors.
//!
//! Shutdown is a quiet-period protocol: after `shutdown_gracefully(quiet,
//! timeout)` the worker keeps draining; once no task has arrived for
//! `quiet`, or `timeout` has elapsed since the request, it terminates and
//! completes its termination future.

use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::future::{Future, Promise};

/// A unit of work for an executor.
pub type Task = Box<dyn FnOnce() + Send>;

/// Default worker pool size: 2 x hardware parallelism.
#[must_use]
pub fn default_pool_size() -> usize {
    2 * num_cpus::get().max(1)
}

/// Tasks drained per loop iteration before the worker re-checks IO and
/// scheduled work.
pub(crate) const TASK_BATCH: usize = 64;

const RUNNING: u8 = 1;
const SHUTTING_DOWN: u8 = 2;
const TERMINATED: u8 = 4;

/// Single-threaded task execution with affinity checks.
pub trait EventExecutor: Send + Sync + 'static {
    /// `true` when called from this executor's worker thread.
    fn in_event_loop(&self) -> bool;

    /// Enqueue `task` FIFO and wake the worker if the caller is outside
    /// it. After termination the task runs inline on the caller as a
    /// last resort (completion notifications must not be lost).
    fn execute(&self, task: Task);

    /// Run `task` after `delay`. Cancellation is honored only until the
    /// task starts.
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle;

    fn is_shutting_down(&self) -> bool;

    /// Begin the quiet-period shutdown protocol. Returns the
    /// termination future.
    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Future<()>;

    /// Completes when the worker has terminated.
    fn termination_future(&self) -> Future<()>;
}

/// Cancellation handle for a scheduled task.
#[derive(Clone)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    pub(crate) fn from_flag(cancelled: Arc<AtomicBool>) -> Self {
        Self { cancelled }
    }

    /// Cancel if the task has not started. Returns `true` on the first
    /// call.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct ScheduledEntry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Option<Task>,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for ScheduledEntry {}
impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledEntry {
    // reversed: BinaryHeap is a max-heap, we want the nearest deadline up
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// State shared between an executor handle and its worker thread.
/// Reused by the plain executor and by the reactor loop.
pub(crate) struct Worker {
    name: String,
    tx: flume::Sender<Task>,
    rx: flume::Receiver<Task>,
    scheduled: Mutex<BinaryHeap<ScheduledEntry>>,
    seq: AtomicU64,
    state: AtomicU8,
    shutdown: Mutex<Option<ShutdownRequest>>,
    last_activity: Mutex<Instant>,
    termination: Promise<()>,
    thread: OnceCell<ThreadId>,
    /// How the owner interrupts a blocked worker: the reactor wakes its
    /// selector, the plain executor pushes a no-op task.
    wake: OnceCell<Arc<dyn Fn() + Send + Sync>>,
}

struct ShutdownRequest {
    quiet_period: Duration,
    timeout: Duration,
    start: Instant,
}

impl Worker {
    pub(crate) fn new(name: impl Into<String>) -> Arc<Self> {
        let (tx, rx) = flume::unbounded();
        Arc::new(Self {
            name: name.into(),
            tx,
            rx,
            scheduled: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            state: AtomicU8::new(RUNNING),
            shutdown: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            termination: Promise::new(),
            thread: OnceCell::new(),
            wake: OnceCell::new(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_wake(&self, wake: Arc<dyn Fn() + Send + Sync>) {
        let _ = self.wake.set(wake);
    }

    pub(crate) fn bind_thread(&self) {
        let _ = self.thread.set(thread::current().id());
    }

    pub(crate) fn in_event_loop(&self) -> bool {
        self.thread.get().copied() == Some(thread::current().id())
    }

    fn wake_up(&self) {
        if let Some(wake) = self.wake.get() {
            wake();
        }
    }

    pub(crate) fn execute(&self, task: Task) {
        if self.state.load(Ordering::Acquire) >= TERMINATED {
            tracing::warn!(executor = %self.name, "task submitted after termination; running inline");
            task();
            return;
        }
        let outside = !self.in_event_loop();
        // the sender half lives as long as self, so this cannot fail
        let _ = self.tx.send(task);
        if outside {
            self.wake_up();
        }
    }

    pub(crate) fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = ScheduledEntry {
            deadline: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            cancelled: cancelled.clone(),
            task: Some(task),
        };
        self.scheduled.lock().push(entry);
        if !self.in_event_loop() {
            self.wake_up();
        }
        ScheduledHandle { cancelled }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.state.load(Ordering::Acquire) >= SHUTTING_DOWN
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) >= TERMINATED
    }

    pub(crate) fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Future<()> {
        if self
            .state
            .compare_exchange(RUNNING, SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.shutdown.lock() = Some(ShutdownRequest {
                quiet_period,
                timeout,
                start: Instant::now(),
            });
            self.wake_up();
        }
        self.termination.future()
    }

    pub(crate) fn termination_future(&self) -> Future<()> {
        self.termination.future()
    }

    /// Whether the FIFO queue has work waiting.
    pub(crate) fn has_tasks(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Next scheduled deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.scheduled.lock().peek().map(|e| e.deadline)
    }

    /// Run scheduled tasks that are due. Returns how many ran.
    pub(crate) fn run_due_scheduled(&self, now: Instant) -> usize {
        let mut ran = 0;
        loop {
            let task = {
                let mut heap = self.scheduled.lock();
                match heap.peek() {
                    Some(entry) if entry.deadline <= now => {
                        let mut entry = heap.pop().expect("peeked entry");
                        if entry.cancelled.load(Ordering::Acquire) {
                            continue;
                        }
                        entry.task.take()
                    }
                    _ => break,
                }
            };
            if let Some(task) = task {
                run_task(&self.name, task);
                ran += 1;
            }
        }
        ran
    }

    /// Drain up to `limit` queued tasks. Returns how many ran.
    pub(crate) fn run_ready(&self, limit: usize) -> usize {
        let mut ran = 0;
        while ran < limit {
            match self.rx.try_recv() {
                Ok(task) => {
                    run_task(&self.name, task);
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        ran
    }

    /// One pass of the task half of a loop iteration: due timers, then a
    /// FIFO batch. Records activity for the quiet-period clock.
    pub(crate) fn run_tasks(&self, limit: usize) -> usize {
        let ran = self.run_due_scheduled(Instant::now()) + self.run_ready(limit);
        if ran > 0 {
            *self.last_activity.lock() = Instant::now();
        }
        ran
    }

    /// Part of the shutdown protocol: drain, then decide whether the
    /// quiet period or the hard timeout has elapsed.
    pub(crate) fn confirm_shutdown(&self) -> bool {
        if !self.is_shutting_down() {
            return false;
        }
        self.run_tasks(usize::MAX);
        let now = Instant::now();
        let guard = self.shutdown.lock();
        let Some(request) = guard.as_ref() else {
            return true;
        };
        if now >= request.start + request.timeout {
            return true;
        }
        now.duration_since(*self.last_activity.lock()) >= request.quiet_period
    }

    /// Final transition. Runs any stragglers, then completes the
    /// termination future.
    pub(crate) fn terminate(&self) {
        self.run_tasks(usize::MAX);
        self.state.store(TERMINATED, Ordering::Release);
        self.termination.try_success(());
        tracing::debug!(executor = %self.name, "terminated");
    }

    /// Sleep until woken, the next deadline, or `cap`, whichever is
    /// first. Used by the plain executor; the reactor parks in its
    /// selector instead.
    fn park(&self, cap: Duration) {
        let deadline = self
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + cap)
            .min(Instant::now() + cap);
        if let Ok(task) = self.rx.recv_deadline(deadline) {
            run_task(&self.name, task);
            *self.last_activity.lock() = Instant::now();
        }
    }
}

fn run_task(name: &str, task: Task) {
    // A panicking task must not take the worker down with it.
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        tracing::error!(executor = %name, ?panic, "task panicked");
    }
}

/// An executor backed by a dedicated OS thread, without a selector.
/// Used for pipeline contexts that need an executor other than their
/// channel's reactor.
pub struct SingleThreadExecutor {
    worker: Arc<Worker>,
}

impl SingleThreadExecutor {
    /// Spawn the worker thread. `name` becomes the thread name.
    pub fn new(name: impl Into<String>) -> io::Result<Arc<Self>> {
        let worker = Worker::new(name);
        {
            let tx = worker.tx.clone();
            worker.set_wake(Arc::new(move || {
                let _ = tx.send(Box::new(|| {}));
            }));
        }
        let loop_worker = worker.clone();
        thread::Builder::new()
            .name(worker.name().to_string())
            .spawn(move || {
                loop_worker.bind_thread();
                loop {
                    loop_worker.run_tasks(TASK_BATCH);
                    if loop_worker.is_shutting_down() {
                        if loop_worker.confirm_shutdown() {
                            break;
                        }
                        loop_worker.park(Duration::from_millis(100));
                        continue;
                    }
                    loop_worker.park(Duration::from_secs(1));
                }
                loop_worker.terminate();
            })?;
        Ok(Arc::new(Self { worker }))
    }
}

impl EventExecutor for SingleThreadExecutor {
    fn in_event_loop(&self) -> bool {
        self.worker.in_event_loop()
    }

    fn execute(&self, task: Task) {
        self.worker.execute(task);
    }

    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle {
        self.worker.schedule(delay, task)
    }

    fn is_shutting_down(&self) -> bool {
        self.worker.is_shutting_down()
    }

    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Future<()> {
        self.worker.shutdown_gracefully(quiet_period, timeout)
    }

    fn termination_future(&self) -> Future<()> {
        self.worker.termination_future()
    }
}

/// Round-robin executor selection for a group.
///
/// Power-of-two sizes use a bitmask; anything else pays the modulus.
pub enum Chooser {
    PowerOfTwo { next: AtomicUsize, mask: usize },
    Generic { next: AtomicUsize, len: usize },
}

impl Chooser {
    #[must_use]
    pub fn for_len(len: usize) -> Self {
        debug_assert!(len > 0);
        if len.is_power_of_two() {
            Self::PowerOfTwo {
                next: AtomicUsize::new(0),
                mask: len - 1,
            }
        } else {
            Self::Generic {
                next: AtomicUsize::new(0),
                len,
            }
        }
    }

    /// Index of the next executor.
    pub fn next(&self) -> usize {
        match self {
            Self::PowerOfTwo { next, mask } => next.fetch_add(1, Ordering::Relaxed) & mask,
            Self::Generic { next, len } => next.fetch_add(1, Ordering::Relaxed) % len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_power_of_two_chooser() {
        let chooser = Chooser::for_len(4);
        let picks: Vec<usize> = (0..8).map(|_| chooser.next()).collect();
        assert_eq!(picks, vec![0, 1, 2, 3, 0, 1, 2, 3]);
        assert!(matches!(chooser, Chooser::PowerOfTwo { .. }));
    }

    #[test]
    fn test_generic_chooser() {
        let chooser = Chooser::for_len(3);
        let picks: Vec<usize> = (0..8).map(|_| chooser.next()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0, 1]);
        assert!(matches!(chooser, Chooser::Generic { .. }));
    }

    #[test]
    fn test_execute_runs_on_worker_thread() {
        let executor = SingleThreadExecutor::new("test-exec").unwrap();
        let promise: Promise<bool> = Promise::new();
        let completer = promise.clone();
        let affine = executor.clone();
        executor.execute(Box::new(move || {
            completer.try_success(affine.in_event_loop());
        }));
        assert!(promise.future().get().unwrap());
        assert!(!executor.in_event_loop());
        executor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn test_schedule_and_cancel() {
        let executor = SingleThreadExecutor::new("test-sched").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        executor.schedule(
            Duration::from_millis(20),
            Box::new(move || {
                observer.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let never = Arc::new(AtomicUsize::new(0));
        let observer = never.clone();
        let handle = executor.schedule(
            Duration::from_millis(20),
            Box::new(move || {
                observer.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(handle.cancel());
        assert!(!handle.cancel());

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(never.load(Ordering::SeqCst), 0);
        executor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn test_graceful_shutdown_completes_termination() {
        let executor = SingleThreadExecutor::new("test-shutdown").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let observer = ran.clone();
            executor.execute(Box::new(move || {
                observer.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let termination =
            executor.shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(2));
        assert!(termination.await_timeout(Duration::from_secs(3)).unwrap());
        assert_eq!(ran.load(Ordering::SeqCst), 16);
        assert!(executor.is_shutting_down());
    }

    #[test]
    fn test_shutdown_timeout_bound() {
        let executor = SingleThreadExecutor::new("test-bound").unwrap();
        // a long quiet period is cut short by the hard timeout
        let started = Instant::now();
        let termination =
            executor.shutdown_gracefully(Duration::from_secs(60), Duration::from_millis(100));
        assert!(termination.await_timeout(Duration::from_secs(2)).unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
