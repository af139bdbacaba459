//! The IO reactor: an event executor that also owns a readiness selector.
//!
//! Each [`NioEventLoop`] runs one worker thread interleaving three duties:
//! polling its `mio::Poll` for readiness, dispatching ready events to the
//! owning channels' low-level operations, and draining queued/scheduled
//! tasks. The `io_ratio` setting bounds the fraction of loop time spent
//! on IO versus tasks so neither side starves the other.
//!
//! An [`EventLoopGroup`] owns N loops and hands out the next one through
//! a round-robin [`Chooser`].

use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::executor::{
    default_pool_size, Chooser, EventExecutor, ScheduledHandle, Task, Worker, TASK_BATCH,
};
use crate::future::{Future, Promise};

/// Default IO-vs-task time split (percent spent on IO).
pub const DEFAULT_IO_RATIO: u8 = 50;

/// Token reserved for the selector waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Upper bound on one blocking select when nothing is scheduled.
const SELECT_CAP: Duration = Duration::from_secs(1);

/// Interest bits a channel can request from its reactor.
///
/// `CONNECT` and `ACCEPT` map onto the selector's writable/readable
/// readiness; the reactor disambiguates by looking at the bits the
/// channel asked for.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct InterestOps(u8);

impl InterestOps {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const CONNECT: Self = Self(4);
    pub const ACCEPT: Self = Self(8);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Translate to selector readiness. `None` when no bit is set.
    #[must_use]
    pub fn to_interest(self) -> Option<Interest> {
        let readable = self.contains(Self::READ) || self.contains(Self::ACCEPT);
        let writable = self.contains(Self::WRITE) || self.contains(Self::CONNECT);
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl std::fmt::Debug for InterestOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut bits = Vec::new();
        if self.contains(Self::READ) {
            bits.push("READ");
        }
        if self.contains(Self::WRITE) {
            bits.push("WRITE");
        }
        if self.contains(Self::CONNECT) {
            bits.push("CONNECT");
        }
        if self.contains(Self::ACCEPT) {
            bits.push("ACCEPT");
        }
        write!(f, "InterestOps({})", bits.join("|"))
    }
}

/// An executor that can also own selectable channels.
pub trait EventLoop: EventExecutor {
    /// Allot a selection token and take ownership of `channel` for
    /// dispatch. Loop-thread only.
    fn attach(&self, channel: &Channel) -> Token;

    /// Forget a token. Loop-thread only.
    fn detach(&self, token: Token);

    /// Selector registry for arming sources, or `None` when the loop has
    /// no selector (the embedded loop).
    fn registry(&self) -> Option<&mio::Registry>;

    /// Non-blocking select, used to flush stale cancelled registrations
    /// before a registration retry.
    fn select_now(&self) -> io::Result<()>;

    /// This loop as a plain executor handle, for promise affinity.
    fn executor(&self) -> Arc<dyn EventExecutor>;
}

/// Adapter exposing a [`Worker`] as an `EventExecutor`.
pub(crate) struct WorkerHandle(pub(crate) Arc<Worker>);

impl EventExecutor for WorkerHandle {
    fn in_event_loop(&self) -> bool {
        self.0.in_event_loop()
    }

    fn execute(&self, task: Task) {
        self.0.execute(task);
    }

    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle {
        self.0.schedule(delay, task)
    }

    fn is_shutting_down(&self) -> bool {
        self.0.is_shutting_down()
    }

    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Future<()> {
        self.0.shutdown_gracefully(quiet_period, timeout)
    }

    fn termination_future(&self) -> Future<()> {
        self.0.termination_future()
    }
}

/// A selector-backed event loop on a dedicated thread.
pub struct NioEventLoop {
    worker: Arc<Worker>,
    exec: Arc<WorkerHandle>,
    registry: mio::Registry,
    poll: Arc<Mutex<Poll>>,
    channels: Arc<Mutex<HashMap<Token, Channel>>>,
    next_token: AtomicUsize,
    io_ratio: AtomicU8,
}

impl NioEventLoop {
    /// Create the loop and spawn its worker thread.
    pub fn new(name: impl Into<String>) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let worker = Worker::new(name);
        {
            let waker = waker.clone();
            worker.set_wake(Arc::new(move || {
                if let Err(err) = waker.wake() {
                    tracing::warn!(%err, "selector wakeup failed");
                }
            }));
        }

        let event_loop = Arc::new(Self {
            worker: worker.clone(),
            exec: Arc::new(WorkerHandle(worker.clone())),
            registry,
            poll: Arc::new(Mutex::new(poll)),
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicUsize::new(0),
            io_ratio: AtomicU8::new(DEFAULT_IO_RATIO),
        });

        let run_loop = event_loop.clone();
        thread::Builder::new()
            .name(worker.name().to_string())
            .spawn(move || run_loop.run())?;
        Ok(event_loop)
    }

    /// Set the IO-vs-task split, clamped to `[1, 100]`.
    pub fn set_io_ratio(&self, ratio: u8) {
        self.io_ratio.store(ratio.clamp(1, 100), Ordering::Relaxed);
    }

    fn run(&self) {
        self.worker.bind_thread();
        let mut events = Events::with_capacity(1024);
        loop {
            let timeout = if self.worker.has_tasks() {
                Some(Duration::ZERO)
            } else {
                let cap = Instant::now() + SELECT_CAP;
                let deadline = self.worker.next_deadline().unwrap_or(cap).min(cap);
                Some(deadline.saturating_duration_since(Instant::now()))
            };

            if let Err(err) = self.poll.lock().poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // an unrecoverable selector means the loop cannot serve
                // its channels; shut down and let close paths run
                tracing::error!(%err, "selector failed; shutting down reactor");
                self.worker
                    .shutdown_gracefully(Duration::ZERO, Duration::ZERO);
            }

            let io_start = Instant::now();
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(event);
            }
            let io_time = io_start.elapsed();

            let ratio = u32::from(self.io_ratio.load(Ordering::Relaxed));
            if ratio >= 100 {
                self.worker.run_tasks(usize::MAX);
            } else {
                // bound task time by the same proportion the ratio grants IO
                let budget = io_time * (100 - ratio) / ratio;
                let task_start = Instant::now();
                loop {
                    let ran = self.worker.run_tasks(TASK_BATCH);
                    if ran == 0 || task_start.elapsed() >= budget {
                        break;
                    }
                }
            }

            if self.worker.is_shutting_down() {
                self.close_all_channels();
                if self.worker.confirm_shutdown() {
                    break;
                }
            }
        }
        self.worker.terminate();
    }

    fn dispatch(&self, event: &mio::event::Event) {
        let channel = match self.channels.lock().get(&event.token()) {
            Some(channel) => channel.clone(),
            // cancelled or stale key
            None => return,
        };
        if !channel.is_open() {
            return;
        }
        let ops = channel.interest_ops();
        if event.is_writable() {
            if ops.contains(InterestOps::CONNECT) {
                channel.internal().finish_connect();
            } else if ops.contains(InterestOps::WRITE) {
                channel.internal().force_flush();
            }
        }
        if event.is_readable()
            && (ops.contains(InterestOps::READ) || ops.contains(InterestOps::ACCEPT))
        {
            channel.internal().read();
        }
    }

    fn close_all_channels(&self) {
        let channels: Vec<Channel> = self.channels.lock().values().cloned().collect();
        for channel in channels {
            channel.close();
        }
    }
}

impl EventExecutor for NioEventLoop {
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

impl EventLoop for NioEventLoop {
    fn attach(&self, channel: &Channel) -> Token {
        debug_assert!(self.in_event_loop());
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.channels.lock().insert(token, channel.clone());
        token
    }

    fn detach(&self, token: Token) {
        debug_assert!(self.in_event_loop());
        self.channels.lock().remove(&token);
    }

    fn registry(&self) -> Option<&mio::Registry> {
        Some(&self.registry)
    }

    fn select_now(&self) -> io::Result<()> {
        debug_assert!(self.in_event_loop());
        // flushes internally-buffered cancellations; anything ready that
        // surfaces here must be dispatched, not dropped, or the edge is
        // lost
        let mut events = Events::with_capacity(64);
        match self.poll.try_lock() {
            Some(mut poll) => poll.poll(&mut events, Some(Duration::ZERO))?,
            None => return Ok(()),
        }
        for event in events.iter() {
            if event.token() != WAKER_TOKEN {
                self.dispatch(event);
            }
        }
        Ok(())
    }

    fn executor(&self) -> Arc<dyn EventExecutor> {
        self.exec.clone()
    }
}

/// A fixed-size group of reactors with round-robin assignment.
pub struct EventLoopGroup {
    children: Vec<Arc<NioEventLoop>>,
    chooser: Chooser,
    termination: Promise<()>,
}

impl EventLoopGroup {
    /// Build a group of `n_threads` loops (0 means 2 x hardware
    /// parallelism). If any loop fails to come up, the ones already
    /// created are shut down and joined before the error is returned.
    pub fn new(n_threads: usize) -> io::Result<Self> {
        Self::with_name(n_threads, "longeron-io")
    }

    /// Same as [`Self::new`] with an explicit thread-name prefix.
    pub fn with_name(n_threads: usize, name_prefix: &str) -> io::Result<Self> {
        let n = if n_threads == 0 {
            default_pool_size()
        } else {
            n_threads
        };

        let mut children = Vec::with_capacity(n);
        for index in 0..n {
            match NioEventLoop::new(format!("{name_prefix}-{index}")) {
                Ok(child) => children.push(child),
                Err(err) => {
                    for child in &children {
                        child.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
                    }
                    for child in &children {
                        let _ = child
                            .termination_future()
                            .await_timeout(Duration::from_secs(5));
                    }
                    return Err(err);
                }
            }
        }

        let termination: Promise<()> = Promise::new();
        let remaining = Arc::new(AtomicUsize::new(n));
        for child in &children {
            let remaining = remaining.clone();
            let termination = termination.clone();
            child.termination_future().add_listener(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    termination.try_success(());
                }
            });
        }

        Ok(Self {
            children,
            chooser: Chooser::for_len(n),
            termination,
        })
    }

    /// Number of loops in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// The next loop per the chooser.
    #[must_use]
    pub fn next(&self) -> Arc<NioEventLoop> {
        self.children[self.chooser.next()].clone()
    }

    /// Apply an IO-vs-task split to every loop.
    pub fn set_io_ratio(&self, ratio: u8) {
        for child in &self.children {
            child.set_io_ratio(ratio);
        }
    }

    /// Register `channel` with the next loop.
    pub fn register(&self, channel: &Channel) -> Future<()> {
        channel.register(self.next())
    }

    /// Begin the quiet-period shutdown on every loop; the returned
    /// future completes when all of them have terminated.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Future<()> {
        for child in &self.children {
            child.shutdown_gracefully(quiet_period, timeout);
        }
        self.termination.future()
    }

    /// Completes when every loop has terminated.
    #[must_use]
    pub fn termination_future(&self) -> Future<()> {
        self.termination.future()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_ops_bits() {
        let ops = InterestOps::READ.with(InterestOps::CONNECT);
        assert!(ops.contains(InterestOps::READ));
        assert!(ops.contains(InterestOps::CONNECT));
        assert!(!ops.contains(InterestOps::WRITE));

        let cleared = ops.without(InterestOps::CONNECT);
        assert!(!cleared.contains(InterestOps::CONNECT));
        assert_eq!(
            cleared.to_interest().unwrap(),
            Interest::READABLE
        );
        assert!(InterestOps::NONE.to_interest().is_none());
    }

    #[test]
    fn test_loop_executes_and_schedules() {
        let event_loop = NioEventLoop::new("test-loop").unwrap();

        let promise: Promise<bool> = Promise::new();
        let completer = promise.clone();
        let affine = event_loop.clone();
        event_loop.execute(Box::new(move || {
            completer.try_success(affine.in_event_loop());
        }));
        assert!(promise.future().get().unwrap());

        let timed: Promise<()> = Promise::new();
        let completer = timed.clone();
        let start = Instant::now();
        event_loop.schedule(
            Duration::from_millis(30),
            Box::new(move || {
                completer.try_success(());
            }),
        );
        timed.future().await_done().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));

        event_loop.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
        assert!(event_loop
            .termination_future()
            .await_timeout(Duration::from_secs(3))
            .unwrap());
    }

    #[test]
    fn test_group_round_robin_and_shutdown() {
        let group = EventLoopGroup::with_name(4, "test-group").unwrap();
        assert_eq!(group.len(), 4);

        // with four loops the chooser wraps on a bitmask
        let first: Vec<_> = (0..4).map(|_| group.next()).collect();
        let second: Vec<_> = (0..4).map(|_| group.next()).collect();
        for (a, b) in first.iter().zip(second.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }

        let termination =
            group.shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(2));
        assert!(termination.await_timeout(Duration::from_secs(5)).unwrap());
    }
}
