//! Embedded channel: the engine without sockets.
//!
//! [`EmbeddedEventLoop`] runs tasks inline on the calling thread with a
//! virtual clock, and [`EmbeddedChannel`] scripts the transport half
//! (connect outcome, queued inbound bytes, kernel pushback). Together
//! they let the channel state machine, the pipeline, the watermarks, and
//! the connect timeout be exercised deterministically, with no OS in the
//! loop.
//!
//! Tasks submitted to the loop do not run by themselves: every scripted
//! operation pumps the queue, and tests can pump explicitly with
//! [`EmbeddedEventLoop::run_pending`] or [`EmbeddedChannel::advance_time`].

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::Token;
use parking_lot::Mutex;

use crate::buffer::ByteBuf;
use crate::channel::{
    Channel, ChannelFuture, ChannelTransport, ReadOutcome, WriteOutcome,
};
use crate::config::ChannelOptions;
use crate::executor::{EventExecutor, ScheduledHandle, Task};
use crate::future::{Future, Promise};
use crate::reactor::EventLoop;

/// An event loop that runs on the calling thread under a virtual clock.
#[derive(Clone)]
pub struct EmbeddedEventLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    tasks: Mutex<VecDeque<Task>>,
    timers: Mutex<Vec<Timer>>,
    now: Mutex<Instant>,
    next_token: AtomicUsize,
    seq: AtomicU64,
    shutting_down: AtomicBool,
    termination: Promise<()>,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Option<Task>,
}

impl Default for EmbeddedEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedEventLoop {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LoopInner {
                tasks: Mutex::new(VecDeque::new()),
                timers: Mutex::new(Vec::new()),
                now: Mutex::new(Instant::now()),
                next_token: AtomicUsize::new(0),
                seq: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                termination: Promise::new(),
            }),
        }
    }

    /// Drain queued tasks and due timers until nothing is runnable.
    pub fn run_pending(&self) {
        loop {
            let task = self.inner.tasks.lock().pop_front();
            if let Some(task) = task {
                task();
                continue;
            }
            match self.pop_due_timer() {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Move the virtual clock forward and run whatever came due.
    pub fn advance_time(&self, by: Duration) {
        *self.inner.now.lock() += by;
        self.run_pending();
    }

    fn pop_due_timer(&self) -> Option<Task> {
        let now = *self.inner.now.lock();
        let mut timers = self.inner.timers.lock();
        loop {
            let due = timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.deadline <= now)
                .min_by_key(|(_, t)| (t.deadline, t.seq))
                .map(|(i, _)| i)?;
            let mut timer = timers.remove(due);
            if timer.cancelled.load(Ordering::Acquire) {
                continue;
            }
            return timer.task.take();
        }
    }
}

impl EventExecutor for EmbeddedEventLoop {
    fn in_event_loop(&self) -> bool {
        // the embedded loop is wherever its caller is
        true
    }

    fn execute(&self, task: Task) {
        self.inner.tasks.lock().push_back(task);
    }

    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.inner.timers.lock().push(Timer {
            deadline: *self.inner.now.lock() + delay,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            cancelled: cancelled.clone(),
            task: Some(task),
        });
        ScheduledHandle::from_flag(cancelled)
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    fn shutdown_gracefully(&self, _quiet_period: Duration, _timeout: Duration) -> Future<()> {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.run_pending();
        self.inner.termination.try_success(());
        self.inner.termination.future()
    }

    fn termination_future(&self) -> Future<()> {
        self.inner.termination.future()
    }
}

impl EventLoop for EmbeddedEventLoop {
    fn attach(&self, _channel: &Channel) -> Token {
        Token(self.inner.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn detach(&self, _token: Token) {}

    fn registry(&self) -> Option<&mio::Registry> {
        None
    }

    fn select_now(&self) -> io::Result<()> {
        Ok(())
    }

    fn executor(&self) -> Arc<dyn EventExecutor> {
        Arc::new(self.clone())
    }
}

/// How the scripted transport answers `do_connect`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// The OS completed synchronously (rare in the wild, loopback-like).
    Immediate,
    /// In progress until [`EmbeddedChannel::establish`] is called.
    Pending,
    /// Refused outright.
    Refused,
}

struct ScriptState {
    connect: Mutex<ConnectBehavior>,
    active: AtomicBool,
    refuse_writes: AtomicBool,
    reads: Mutex<VecDeque<Bytes>>,
    eof: AtomicBool,
    written: Mutex<Vec<Bytes>>,
}

struct EmbeddedTransport {
    script: Arc<ScriptState>,
}

impl ChannelTransport for EmbeddedTransport {
    fn source(&mut self) -> Option<&mut dyn mio::event::Source> {
        None
    }

    fn is_active(&self) -> bool {
        self.script.active.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn do_bind(&mut self, _addr: SocketAddr) -> io::Result<()> {
        Ok(())
    }

    fn do_connect(&mut self, _remote: SocketAddr, _local: Option<SocketAddr>) -> io::Result<bool> {
        match *self.script.connect.lock() {
            ConnectBehavior::Immediate => {
                self.script.active.store(true, Ordering::Release);
                Ok(true)
            }
            ConnectBehavior::Pending => Ok(false),
            ConnectBehavior::Refused => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
        }
    }

    fn do_finish_connect(&mut self) -> io::Result<()> {
        if self.script.active.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::NotConnected))
        }
    }

    fn do_close(&mut self) -> io::Result<()> {
        self.script.active.store(false, Ordering::Release);
        Ok(())
    }

    fn do_read(&mut self, buf: &ByteBuf) -> io::Result<ReadOutcome> {
        let next = self.script.reads.lock().pop_front();
        match next {
            Some(bytes) => {
                buf.write_slice(&bytes)
                    .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
                Ok(ReadOutcome::Data(bytes.len()))
            }
            None if self.script.eof.load(Ordering::Acquire) => Ok(ReadOutcome::Eof),
            None => Ok(ReadOutcome::WouldBlock),
        }
    }

    fn do_write(&mut self, buf: &ByteBuf) -> io::Result<WriteOutcome> {
        if self.script.refuse_writes.load(Ordering::Acquire) {
            return Ok(WriteOutcome::WouldBlock);
        }
        let n = buf.readable_bytes();
        let bytes = buf
            .read_bytes(n)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        self.script.written.lock().push(bytes);
        Ok(WriteOutcome::Wrote(n))
    }
}

/// A channel over a scripted transport, registered on an embedded loop.
pub struct EmbeddedChannel {
    channel: Channel,
    event_loop: EmbeddedEventLoop,
    script: Arc<ScriptState>,
}

impl EmbeddedChannel {
    /// A channel whose connects complete synchronously.
    #[must_use]
    pub fn new(options: &ChannelOptions) -> Self {
        Self::with_setup(options, ConnectBehavior::Immediate, |_| {})
    }

    /// A channel with an explicit connect script.
    #[must_use]
    pub fn with_connect(options: &ChannelOptions, behavior: ConnectBehavior) -> Self {
        Self::with_setup(options, behavior, |_| {})
    }

    /// Full control: `setup` runs against the unregistered channel (for
    /// installing initializers whose callbacks must defer until
    /// registration), then the channel registers and the loop is pumped.
    pub fn with_setup(
        options: &ChannelOptions,
        behavior: ConnectBehavior,
        setup: impl FnOnce(&Channel),
    ) -> Self {
        let script = Arc::new(ScriptState {
            connect: Mutex::new(behavior),
            active: AtomicBool::new(false),
            refuse_writes: AtomicBool::new(false),
            reads: Mutex::new(VecDeque::new()),
            eof: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
        });
        let transport = EmbeddedTransport {
            script: script.clone(),
        };
        let channel = Channel::new(Box::new(transport), options);
        setup(&channel);

        let event_loop = EmbeddedEventLoop::new();
        let registration = channel.register(Arc::new(event_loop.clone()));
        event_loop.run_pending();
        assert!(
            registration.is_success(),
            "embedded registration is synchronous"
        );

        Self {
            channel,
            event_loop,
            script,
        }
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    #[must_use]
    pub fn event_loop(&self) -> &EmbeddedEventLoop {
        &self.event_loop
    }

    pub fn run_pending(&self) {
        self.event_loop.run_pending();
    }

    pub fn advance_time(&self, by: Duration) {
        self.event_loop.advance_time(by);
    }

    /// Issue a connect and pump the loop once.
    pub fn connect(&self, remote: SocketAddr) -> ChannelFuture {
        let future = self.channel.connect(remote);
        self.run_pending();
        future
    }

    /// Script the peer completing the handshake of a pending connect.
    pub fn establish(&self) {
        self.script.active.store(true, Ordering::Release);
        self.channel.internal().finish_connect();
        self.run_pending();
    }

    /// Queue bytes "from the socket" and run a read batch.
    pub fn write_inbound(&self, bytes: Bytes) {
        self.script.reads.lock().push_back(bytes);
        self.channel.internal().read();
        self.run_pending();
    }

    /// Script end-of-stream on the next read.
    pub fn feed_eof(&self) {
        self.script.eof.store(true, Ordering::Release);
        self.channel.internal().read();
        self.run_pending();
    }

    /// Toggle kernel pushback. Turning it off re-runs the flush, like a
    /// writable-readiness wakeup would.
    pub fn refuse_writes(&self, refuse: bool) {
        self.script.refuse_writes.store(refuse, Ordering::Release);
        if !refuse {
            self.channel.internal().force_flush();
        }
        self.run_pending();
    }

    /// Everything the "kernel" accepted so far.
    #[must_use]
    pub fn written(&self) -> Vec<Bytes> {
        self.script.written.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LongeronError, Result};
    use crate::context::Context;
    use crate::handler::{ChannelHandler, HandlerBox, InboundHandler};
    use crate::initializer::ChannelInitializer;
    use crate::message::Message;

    /// Records every lifecycle event it sees, forwarding each one.
    #[derive(Clone)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
            let events = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    events: events.clone(),
                },
                events,
            )
        }

        fn record(&self, event: &str) {
            self.events.lock().push(event.to_string());
        }
    }

    impl ChannelHandler for Recorder {
        fn handler_added(&self, _ctx: &Context) -> Result<()> {
            self.record("handler_added");
            Ok(())
        }
    }

    impl InboundHandler for Recorder {
        fn channel_registered(&self, ctx: &Context) -> Result<()> {
            self.record("channel_registered");
            ctx.fire_channel_registered();
            Ok(())
        }

        fn channel_active(&self, ctx: &Context) -> Result<()> {
            self.record("channel_active");
            ctx.fire_channel_active();
            Ok(())
        }

        fn channel_inactive(&self, ctx: &Context) -> Result<()> {
            self.record("channel_inactive");
            ctx.fire_channel_inactive();
            Ok(())
        }

        fn channel_unregistered(&self, ctx: &Context) -> Result<()> {
            self.record("channel_unregistered");
            ctx.fire_channel_unregistered();
            Ok(())
        }

        fn channel_read(&self, ctx: &Context, msg: Message) -> Result<()> {
            self.record("channel_read");
            ctx.fire_channel_read(msg);
            Ok(())
        }

        fn channel_writability_changed(&self, ctx: &Context, writable: bool) -> Result<()> {
            self.record(&format!("writability_changed:{writable}"));
            ctx.fire_channel_writability_changed(writable);
            Ok(())
        }
    }

    fn remote() -> SocketAddr {
        "192.0.2.1:4000".parse().unwrap()
    }

    #[test]
    fn test_initializer_then_connect_event_order() {
        let (recorder, events) = Recorder::new();
        let init = ChannelInitializer::new(move |channel: &Channel| {
            channel
                .pipeline()
                .add_last(Some("user"), HandlerBox::inbound(recorder.clone()))
        });
        let embedded = EmbeddedChannel::with_setup(
            &ChannelOptions::default(),
            ConnectBehavior::Pending,
            |channel| {
                channel
                    .pipeline()
                    .add_last(Some("init"), HandlerBox::inbound(init))
                    .unwrap();
            },
        );

        // the initializer ran at registration and removed itself
        assert_eq!(embedded.channel().pipeline().names(), vec!["user"]);

        let future = embedded.connect(remote());
        assert!(!future.is_done());
        embedded.establish();
        assert!(future.is_success());
        assert!(embedded.channel().is_active());

        assert_eq!(
            *events.lock(),
            vec!["handler_added", "channel_registered", "channel_active"]
        );
    }

    #[test]
    fn test_connect_timeout_closes_channel() {
        let (recorder, events) = Recorder::new();
        let options = ChannelOptions::default().with_connect_timeout(Duration::from_millis(100));
        let embedded = EmbeddedChannel::with_setup(
            &options,
            ConnectBehavior::Pending,
            |channel| {
                channel
                    .pipeline()
                    .add_last(Some("user"), HandlerBox::inbound(recorder))
                    .unwrap();
            },
        );

        let future = embedded.connect(remote());
        assert!(!future.is_done());

        embedded.advance_time(Duration::from_millis(150));
        assert!(matches!(
            future.cause(),
            Some(LongeronError::ConnectTimeout(_))
        ));
        assert!(!embedded.channel().is_open());
        assert!(embedded
            .channel()
            .close_future()
            .await_timeout(Duration::ZERO)
            .unwrap());

        let seen = events.lock().clone();
        assert!(!seen.contains(&"channel_active".to_string()));
        assert!(seen.contains(&"channel_unregistered".to_string()));
    }

    #[test]
    fn test_second_connect_fails_with_pending() {
        let embedded =
            EmbeddedChannel::with_connect(&ChannelOptions::default(), ConnectBehavior::Pending);
        let first = embedded.connect(remote());
        let second = embedded.connect(remote());
        assert!(matches!(
            second.cause(),
            Some(LongeronError::ConnectionPending)
        ));
        assert!(!first.is_done());
    }

    #[test]
    fn test_writability_watermarks() {
        let (recorder, events) = Recorder::new();
        let options = ChannelOptions::default()
            .with_write_buffer_water_marks(32 * 1024, 64 * 1024);
        let embedded = EmbeddedChannel::with_setup(
            &options,
            ConnectBehavior::Immediate,
            |channel| {
                channel
                    .pipeline()
                    .add_last(Some("user"), HandlerBox::inbound(recorder))
                    .unwrap();
            },
        );
        embedded.connect(remote()).sync().unwrap();

        embedded.refuse_writes(true);
        let alloc = crate::alloc::UnpooledAllocator;
        for _ in 0..7 {
            use crate::alloc::BufAllocator;
            let buf = alloc.heap_buffer(10 * 1024);
            buf.write_slice(&[7u8; 10 * 1024]).unwrap();
            embedded.channel().write_and_flush(Message::from(buf));
        }
        embedded.run_pending();

        assert!(!embedded.channel().is_writable());
        let toggles: Vec<String> = events
            .lock()
            .iter()
            .filter(|e| e.starts_with("writability"))
            .cloned()
            .collect();
        assert_eq!(toggles, vec!["writability_changed:false"]);

        embedded.refuse_writes(false);
        assert!(embedded.channel().is_writable());
        let toggles: Vec<String> = events
            .lock()
            .iter()
            .filter(|e| e.starts_with("writability"))
            .cloned()
            .collect();
        assert_eq!(
            toggles,
            vec!["writability_changed:false", "writability_changed:true"]
        );
    }

    #[test]
    fn test_close_races_flush_fails_promise_without_bytes() {
        let embedded =
            EmbeddedChannel::with_connect(&ChannelOptions::default(), ConnectBehavior::Immediate);
        embedded.connect(remote()).sync().unwrap();

        // stall the kernel, then race a close against the flush
        embedded.refuse_writes(true);
        use crate::alloc::BufAllocator;
        let buf = crate::alloc::UnpooledAllocator.heap_buffer(64);
        buf.write_slice(b"never reaches the wire").unwrap();
        let write_future = embedded.channel().write_and_flush(Message::from(buf));
        embedded.run_pending();

        let close_future = embedded.channel().close();
        embedded.run_pending();

        close_future.sync().unwrap();
        assert!(matches!(
            write_future.cause(),
            Some(LongeronError::ClosedChannel)
        ));
        assert!(embedded.written().is_empty());
    }

    #[test]
    fn test_double_close_same_terminal_state() {
        let embedded =
            EmbeddedChannel::with_connect(&ChannelOptions::default(), ConnectBehavior::Immediate);
        embedded.connect(remote()).sync().unwrap();

        let first = embedded.channel().close();
        let second = embedded.channel().close();
        embedded.run_pending();

        assert!(first.is_success());
        assert!(second.is_success());
        assert!(!embedded.channel().is_open());
    }

    #[test]
    fn test_inbound_bytes_flow_and_eof_closes() {
        let (recorder, events) = Recorder::new();
        let embedded = EmbeddedChannel::with_setup(
            &ChannelOptions::default(),
            ConnectBehavior::Immediate,
            |channel| {
                channel
                    .pipeline()
                    .add_last(Some("user"), HandlerBox::inbound(recorder))
                    .unwrap();
            },
        );
        embedded.connect(remote()).sync().unwrap();

        embedded.write_inbound(Bytes::from_static(b"ping"));
        assert!(events.lock().contains(&"channel_read".to_string()));

        embedded.feed_eof();
        assert!(!embedded.channel().is_open());
        assert!(events.lock().contains(&"channel_inactive".to_string()));
    }

    #[test]
    fn test_add_remove_roundtrip_restores_chain() {
        let embedded =
            EmbeddedChannel::with_connect(&ChannelOptions::default(), ConnectBehavior::Immediate);
        let pipeline = embedded.channel().pipeline();
        let before = pipeline.names();

        let (recorder, _) = Recorder::new();
        pipeline
            .add_last(Some("transient"), HandlerBox::inbound(recorder))
            .unwrap();
        embedded.run_pending();
        assert_eq!(pipeline.names(), vec!["transient"]);

        pipeline.remove("transient").unwrap();
        embedded.run_pending();
        assert_eq!(pipeline.names(), before);
    }
}
