//! Channels: per-connection state and the low-level IO contract.
//!
//! A [`Channel`] is created unregistered, attaches to exactly one
//! reactor for its lifetime via [`Channel::register`], and then moves
//! through connect / active / closing / unregistered. Public operations
//! are all asynchronous: they enter the pipeline, whose context layer
//! hops onto the channel's reactor, so completion is always observed
//! there.
//!
//! [`Internal`] is the restricted contract beneath the pipeline head:
//! only the owning reactor (readiness dispatch) and the head sentinel
//! (outbound floor) call it. It owns the reactor-affine state: the
//! selection key, the connect attempt, the `read_pending` flag, and the
//! outbound buffer.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mio::Token;
use parking_lot::Mutex;

use crate::config::{ChannelConfig, ChannelOptions, RecvBufHandle};
use crate::error::LongeronError;
use crate::executor::EventExecutor;
use crate::future::{Future, Promise};
use crate::message::Message;
use crate::outbound::{fail_entries, HeadEntry, OutboundBuffer};
use crate::pipeline::Pipeline;
use crate::reactor::{EventLoop, InterestOps};

/// Completion promise for a channel operation.
pub type ChannelPromise = Promise<()>;
/// Completion future for a channel operation.
pub type ChannelFuture = Future<()>;

/// Process-unique channel identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// One transport read.
pub enum ReadOutcome {
    /// `n` bytes were appended to the buffer.
    Data(usize),
    /// The socket has nothing buffered right now.
    WouldBlock,
    /// The peer closed its write side.
    Eof,
}

/// One transport write.
pub enum WriteOutcome {
    /// `n` bytes were accepted by the kernel (the buffer's read cursor
    /// has advanced past them).
    Wrote(usize),
    /// The kernel refused further bytes.
    WouldBlock,
}

/// The transport-specific half of a channel: the socket operations the
/// engine's state machine drives. Implementations live in transport
/// crates; the embedded transport scripts them for tests.
pub trait ChannelTransport: Send + 'static {
    /// The selectable source to arm with the reactor, or `None` when the
    /// transport has nothing selectable (embedded).
    fn source(&mut self) -> Option<&mut dyn mio::event::Source>;

    /// Whether the underlying connection is established.
    fn is_active(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn do_bind(&mut self, addr: SocketAddr) -> io::Result<()>;

    /// Start a connect. `Ok(true)` means the OS finished synchronously;
    /// `Ok(false)` means in progress (readiness will report it).
    fn do_connect(&mut self, remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<bool>;

    /// Resolve an in-progress connect once the selector reports it.
    /// Must surface the underlying failure, if any.
    fn do_finish_connect(&mut self) -> io::Result<()>;

    /// Half-close, where the transport supports it. Stream transports
    /// without a distinct half-close report `Unsupported` and the
    /// channel falls back to a full close.
    fn do_disconnect(&mut self) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn do_close(&mut self) -> io::Result<()>;

    /// Read once into `buf` (append at the write cursor).
    fn do_read(&mut self, buf: &crate::buffer::ByteBuf) -> io::Result<ReadOutcome>;

    /// Write once from `buf` (consume at the read cursor).
    fn do_write(&mut self, buf: &crate::buffer::ByteBuf) -> io::Result<WriteOutcome>;
}

struct SelectionKey {
    token: Token,
    ops: InterestOps,
    /// Whether the source is currently registered with the selector.
    armed: bool,
}

struct ConnectInFlight {
    remote: SocketAddr,
    promise: ChannelPromise,
    timeout: Option<crate::executor::ScheduledHandle>,
}

/// Reactor-affine mutable state. Only the owning loop touches this
/// (public entry points hop there first), so the lock is uncontended.
struct IoState {
    key: Option<SelectionKey>,
    connect: Option<ConnectInFlight>,
    outbound: OutboundBuffer,
    read_pending: bool,
    in_flush: bool,
    recv_handle: Option<Box<dyn RecvBufHandle>>,
}

pub(crate) struct ChannelInner {
    id: ChannelId,
    parent: Option<Channel>,
    config: ChannelConfig,
    pipeline: Pipeline,
    transport: Mutex<Box<dyn ChannelTransport>>,
    io: Mutex<IoState>,
    open: AtomicBool,
    registered: AtomicBool,
    active: AtomicBool,
    writable: AtomicBool,
    inactive_fired: AtomicBool,
    close_initiated: AtomicBool,
    close_promise: ChannelPromise,
    event_loop: Mutex<Option<Arc<dyn EventLoop>>>,
    executor: Mutex<Option<Arc<dyn EventExecutor>>>,
}

/// The engine's per-connection object.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// A fresh, unregistered channel over `transport`.
    pub fn new(transport: Box<dyn ChannelTransport>, options: &ChannelOptions) -> Self {
        Self::build(transport, options, None)
    }

    /// A channel accepted by `parent` (server transports).
    pub fn new_with_parent(
        transport: Box<dyn ChannelTransport>,
        options: &ChannelOptions,
        parent: Channel,
    ) -> Self {
        Self::build(transport, options, Some(parent))
    }

    fn build(
        transport: Box<dyn ChannelTransport>,
        options: &ChannelOptions,
        parent: Option<Channel>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| ChannelInner {
            id: ChannelId::next(),
            parent,
            config: ChannelConfig::from_options(options),
            pipeline: Pipeline::new(weak.clone()),
            transport: Mutex::new(transport),
            io: Mutex::new(IoState {
                key: None,
                connect: None,
                outbound: OutboundBuffer::new(),
                read_pending: false,
                in_flush: false,
                recv_handle: None,
            }),
            open: AtomicBool::new(true),
            registered: AtomicBool::new(false),
            active: AtomicBool::new(false),
            writable: AtomicBool::new(true),
            inactive_fired: AtomicBool::new(false),
            close_initiated: AtomicBool::new(false),
            close_promise: Promise::new(),
            event_loop: Mutex::new(None),
            executor: Mutex::new(None),
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    #[must_use]
    pub fn parent(&self) -> Option<Channel> {
        self.inner.parent.clone()
    }

    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn pipeline(&self) -> Pipeline {
        self.inner.pipeline.clone()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Whether pending outbound bytes are under the high watermark.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.inner.writable.load(Ordering::Acquire)
    }

    /// Bytes queued in the outbound buffer, flushed or not.
    #[must_use]
    pub fn pending_outbound_bytes(&self) -> usize {
        self.inner.io.lock().outbound.pending_bytes()
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.lock().local_addr()
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.lock().peer_addr()
    }

    /// The reactor this channel is attached to, once registered.
    #[must_use]
    pub fn event_loop(&self) -> Option<Arc<dyn EventLoop>> {
        self.inner.event_loop.lock().clone()
    }

    /// The reactor as a plain executor, once registered.
    #[must_use]
    pub fn executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.inner.executor.lock().clone()
    }

    /// Completes when the close sequence has fully run.
    #[must_use]
    pub fn close_future(&self) -> ChannelFuture {
        self.inner.close_promise.future()
    }

    /// A promise that ignores completion, for fire-and-forget writes.
    #[must_use]
    pub fn void_promise(&self) -> ChannelPromise {
        Promise::void()
    }

    fn new_promise(&self) -> ChannelPromise {
        match self.executor() {
            Some(executor) => Promise::with_executor(executor),
            None => Promise::new(),
        }
    }

    // --- public asynchronous operations ---

    /// Attach this channel to `event_loop` for the rest of its life.
    /// Fails with `IllegalState` if called twice.
    pub fn register(&self, event_loop: Arc<dyn EventLoop>) -> ChannelFuture {
        let executor = event_loop.executor();
        let promise: ChannelPromise = Promise::with_executor(executor.clone());
        {
            let mut slot = self.inner.event_loop.lock();
            if slot.is_some() {
                promise.try_failure(LongeronError::IllegalState("channel already registered"));
                return promise.future();
            }
            *slot = Some(event_loop);
            *self.inner.executor.lock() = Some(executor.clone());
        }
        let channel = self.clone();
        let completion = promise.clone();
        if executor.in_event_loop() {
            channel.register0(completion);
        } else {
            executor.execute(Box::new(move || channel.register0(completion)));
        }
        promise.future()
    }

    pub fn bind(&self, addr: SocketAddr) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline().bind(addr, promise.clone());
        promise.future()
    }

    pub fn connect(&self, remote: SocketAddr) -> ChannelFuture {
        self.connect_with_local(remote, None)
    }

    pub fn connect_with_local(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline().connect(remote, local, promise.clone());
        promise.future()
    }

    pub fn disconnect(&self) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline().disconnect(promise.clone());
        promise.future()
    }

    /// Idempotent: a second close completes with the same terminal state
    /// as the first.
    pub fn close(&self) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline().close(promise.clone());
        promise.future()
    }

    pub fn deregister(&self) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline().deregister(promise.clone());
        promise.future()
    }

    /// Request one read batch (used directly when autoread is off).
    pub fn read(&self) {
        self.pipeline().read();
    }

    pub fn write(&self, msg: Message) -> ChannelFuture {
        self.pipeline().write(msg)
    }

    pub fn write_and_flush(&self, msg: Message) -> ChannelFuture {
        self.pipeline().write_and_flush(msg)
    }

    pub fn flush(&self) {
        self.pipeline().flush();
    }

    /// The restricted low-level contract. Reactor and pipeline head
    /// only.
    pub(crate) fn internal(&self) -> Internal<'_> {
        Internal { channel: self }
    }

    /// Interest bits currently requested from the reactor.
    pub(crate) fn interest_ops(&self) -> InterestOps {
        self.inner
            .io
            .lock()
            .key
            .as_ref()
            .map_or(InterestOps::NONE, |key| key.ops)
    }

    // --- registration and interest plumbing (loop thread) ---

    fn register0(&self, promise: ChannelPromise) {
        if !self.is_open() {
            // registration lost the race with a close; make sure the
            // transport is really gone before reporting failure
            self.internal().close_forcibly();
            promise.try_failure(LongeronError::ClosedChannel);
            return;
        }
        let event_loop = self.event_loop().expect("event loop assigned");
        let token = event_loop.attach(self);
        self.inner.io.lock().key = Some(SelectionKey {
            token,
            ops: InterestOps::NONE,
            armed: false,
        });
        self.inner.registered.store(true, Ordering::Release);
        tracing::debug!(channel = %self.id(), "registered");

        let pipeline = self.pipeline();
        pipeline.invoke_handler_added_if_needed();
        promise.try_success(());
        pipeline.fire_channel_registered();
        if self.inner.transport.lock().is_active() {
            // registering an already-established connection
            self.inner.active.store(true, Ordering::Release);
            pipeline.fire_channel_active();
        }
    }

    fn update_interest(&self, f: impl FnOnce(InterestOps) -> InterestOps) {
        self.assert_loop();
        let Some(event_loop) = self.event_loop() else {
            return;
        };
        let mut io = self.inner.io.lock();
        let Some(key) = io.key.as_mut() else {
            return;
        };
        let new_ops = f(key.ops);
        if new_ops == key.ops {
            return;
        }
        key.ops = new_ops;
        let token = key.token;

        let Some(registry) = event_loop.registry() else {
            return;
        };
        let mut transport = self.inner.transport.lock();
        let Some(source) = transport.source() else {
            return;
        };
        match new_ops.to_interest() {
            None => {
                if key.armed {
                    if let Err(err) = registry.deregister(source) {
                        tracing::warn!(channel = %self.id(), %err, "selector deregister failed");
                    }
                    key.armed = false;
                }
            }
            Some(interest) => {
                if key.armed {
                    if let Err(err) = registry.reregister(source, token, interest) {
                        tracing::warn!(channel = %self.id(), %err, "interest update failed");
                    }
                } else {
                    if let Err(first) = registry.register(source, token, interest) {
                        // the selector may still hold a cancelled key for
                        // this source; flush cancellations and retry once
                        tracing::debug!(channel = %self.id(), err = %first, "registration retry");
                        let _ = event_loop.select_now();
                        match registry.register(source, token, interest) {
                            Ok(()) => key.armed = true,
                            Err(err) => {
                                tracing::error!(channel = %self.id(), %err, "registration failed");
                                return;
                            }
                        }
                    } else {
                        key.armed = true;
                    }
                }
            }
        }
    }

    fn assert_loop(&self) {
        #[cfg(debug_assertions)]
        if let Some(executor) = self.executor() {
            debug_assert!(
                executor.in_event_loop(),
                "low-level channel operation outside the owning reactor"
            );
        }
    }

    fn fire_writability(&self, writable: bool) {
        self.inner.writable.store(writable, Ordering::Release);
        self.pipeline().fire_channel_writability_changed(writable);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .field("registered", &self.is_registered())
            .field("active", &self.is_active())
            .finish()
    }
}

/// The low-level contract. Every method must run on the owning reactor.
pub(crate) struct Internal<'a> {
    channel: &'a Channel,
}

impl Internal<'_> {
    fn inner(&self) -> &ChannelInner {
        &self.channel.inner
    }

    pub fn bind(&self, addr: SocketAddr, promise: ChannelPromise) {
        self.channel.assert_loop();
        if !self.channel.is_open() {
            promise.try_failure(LongeronError::ClosedChannel);
            return;
        }
        let result = self.inner().transport.lock().do_bind(addr);
        match result {
            Ok(()) => {
                let was_active = self.channel.is_active();
                let now_active = self.inner().transport.lock().is_active();
                promise.try_success(());
                if !was_active && now_active {
                    self.inner().active.store(true, Ordering::Release);
                    self.channel.pipeline().fire_channel_active();
                }
            }
            Err(err) => {
                promise.try_failure(err.into());
            }
        }
    }

    /// Start the connect protocol. At most one attempt may be
    /// outstanding; a second fails with `ConnectionPending` before any
    /// OS connect is attempted.
    pub fn connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) {
        self.channel.assert_loop();
        if !self.channel.is_open() {
            promise.try_failure(LongeronError::ClosedChannel);
            return;
        }
        let Some(executor) = self.channel.executor() else {
            promise.try_failure(LongeronError::IllegalState("channel not registered"));
            return;
        };
        if self.inner().io.lock().connect.is_some() {
            promise.try_failure(LongeronError::ConnectionPending);
            return;
        }

        let attempt = self.inner().transport.lock().do_connect(remote, local);
        match attempt {
            Ok(true) => self.fulfill_connect(&promise),
            Ok(false) => {
                let timeout = self.inner().config.connect_timeout();
                let handle = if timeout.is_zero() {
                    None
                } else {
                    let channel = self.channel.clone();
                    Some(executor.schedule(
                        timeout,
                        Box::new(move || channel.internal().connect_timed_out(timeout)),
                    ))
                };
                self.inner().io.lock().connect = Some(ConnectInFlight {
                    remote,
                    promise: promise.clone(),
                    timeout: handle,
                });
                self.channel
                    .update_interest(|ops| ops.with(InterestOps::CONNECT));

                // a cancelled connect closes the channel and drops the timer
                let channel = self.channel.clone();
                promise.future().add_listener(move |future| {
                    if future.is_cancelled() {
                        channel.internal().connect_cancelled();
                    }
                });
            }
            Err(err) => {
                promise.try_failure(map_connect_error(err, remote));
                self.close_now();
            }
        }
    }

    /// Resolve a pending connect once the selector reports readiness.
    pub fn finish_connect(&self) {
        self.channel.assert_loop();
        let Some(conn) = self.inner().io.lock().connect.take() else {
            return;
        };
        if let Some(timeout) = &conn.timeout {
            timeout.cancel();
        }
        self.channel
            .update_interest(|ops| ops.without(InterestOps::CONNECT));

        let result = self.inner().transport.lock().do_finish_connect();
        match result {
            Ok(()) => self.fulfill_connect(&conn.promise),
            Err(err) => {
                tracing::debug!(channel = %self.channel.id(), %err, "connect failed");
                conn.promise.try_failure(map_connect_error(err, conn.remote));
                self.close_now();
            }
        }
    }

    fn fulfill_connect(&self, promise: &ChannelPromise) {
        let was_active = self.channel.is_active();
        let now_active = self.inner().transport.lock().is_active();
        promise.try_success(());
        if !was_active && now_active {
            self.inner().active.store(true, Ordering::Release);
            self.channel.pipeline().fire_channel_active();
        }
    }

    fn connect_timed_out(&self, after: std::time::Duration) {
        let Some(conn) = self.inner().io.lock().connect.take() else {
            return;
        };
        tracing::debug!(channel = %self.channel.id(), remote = %conn.remote, "connect timed out");
        conn.promise
            .try_failure(LongeronError::ConnectTimeout(after));
        self.close_now();
    }

    fn connect_cancelled(&self) {
        if let Some(conn) = self.inner().io.lock().connect.take() {
            if let Some(timeout) = &conn.timeout {
                timeout.cancel();
            }
        }
        self.close_now();
    }

    /// Arm read interest; the next readiness batch will flow through
    /// `read`.
    pub fn begin_read(&self) {
        self.channel.assert_loop();
        if !self.channel.is_active() {
            return;
        }
        self.inner().io.lock().read_pending = true;
        self.channel
            .update_interest(|ops| ops.with(InterestOps::READ));
    }

    /// The readiness-driven read loop. Buffer sizing and batch length
    /// come from the channel's receive-buffer policy.
    pub fn read(&self) {
        self.channel.assert_loop();
        if !self.channel.is_open() {
            return;
        }
        let alloc = self.inner().config.allocator();
        let mut handle = {
            let mut io = self.inner().io.lock();
            io.read_pending = false;
            io.recv_handle
                .take()
                .unwrap_or_else(|| self.inner().config.recv_buf_allocator().new_handle())
        };
        handle.reset();

        let pipeline = self.channel.pipeline();
        let mut eof = false;
        let mut error: Option<io::Error> = None;
        let mut stopped_early = false;
        loop {
            let buf = handle.allocate(alloc.as_ref());
            let outcome = self.inner().transport.lock().do_read(&buf);
            match outcome {
                Ok(ReadOutcome::Data(n)) => {
                    handle.record_read(n);
                    pipeline.fire_channel_read(Message::Buf(buf));
                    if !handle.continue_reading() {
                        // batch cap reached with data possibly left in the
                        // socket; the re-arm below picks it up
                        stopped_early = true;
                        break;
                    }
                }
                Ok(ReadOutcome::WouldBlock) => {
                    let _ = buf.release();
                    break;
                }
                Ok(ReadOutcome::Eof) => {
                    let _ = buf.release();
                    eof = true;
                    break;
                }
                Err(err) => {
                    let _ = buf.release();
                    error = Some(err);
                    break;
                }
            }
        }
        handle.read_complete();
        self.inner().io.lock().recv_handle = Some(handle);
        pipeline.fire_channel_read_complete();

        if let Some(err) = error {
            pipeline.fire_exception_caught(err.into());
            self.close_now();
        } else if eof {
            self.close_now();
        } else {
            let auto_read = self.inner().config.is_auto_read();
            let read_pending = self.inner().io.lock().read_pending;
            if !auto_read && !read_pending {
                // nobody re-issued read(): drop interest until they do
                self.channel
                    .update_interest(|ops| ops.without(InterestOps::READ));
            } else if stopped_early {
                let channel = self.channel.clone();
                if let Some(executor) = self.channel.executor() {
                    executor.execute(Box::new(move || channel.internal().read()));
                }
            }
        }
    }

    /// Queue a message behind the flush boundary.
    pub fn write(&self, msg: Message, promise: ChannelPromise) {
        self.channel.assert_loop();
        if !self.channel.is_open() || self.inner().close_initiated.load(Ordering::Acquire) {
            if let Err(err) = msg.release() {
                tracing::debug!(%err, "write after close was already released");
            }
            promise.try_failure(LongeronError::ClosedChannel);
            return;
        }
        let size = msg.size_hint();
        let high = self.inner().config.write_buffer_high_water_mark();
        let crossed = self
            .inner()
            .io
            .lock()
            .outbound
            .add_message(msg, size, promise, high);
        if crossed {
            self.channel.fire_writability(false);
        }
    }

    /// Mark queued messages flushable and try to drain now.
    pub fn flush(&self) {
        self.channel.assert_loop();
        self.inner().io.lock().outbound.add_flush();
        self.flush0();
    }

    /// Drain on writable readiness.
    pub fn force_flush(&self) {
        self.channel.assert_loop();
        self.flush0();
    }

    fn flush0(&self) {
        {
            let mut io = self.inner().io.lock();
            if io.in_flush {
                return;
            }
            io.in_flush = true;
        }
        if self.channel.is_open() {
            self.drain_outbound();
        }
        self.inner().io.lock().in_flush = false;
    }

    fn drain_outbound(&self) {
        let low = self.inner().config.write_buffer_low_water_mark();
        loop {
            let head = self.inner().io.lock().outbound.head();
            match head {
                None => {
                    // fully drained
                    self.channel
                        .update_interest(|ops| ops.without(InterestOps::WRITE));
                    return;
                }
                Some(HeadEntry::Unsupported) => {
                    let removed = self.inner().io.lock().outbound.remove_complete(low);
                    if let Some((entry, restored)) = removed {
                        entry.promise.try_failure(LongeronError::encoder(
                            "message type not writable by the transport",
                        ));
                        if restored {
                            self.channel.fire_writability(true);
                        }
                    }
                }
                Some(HeadEntry::Buf(buf)) => {
                    if buf.readable_bytes() == 0 {
                        let removed = self.inner().io.lock().outbound.remove_complete(low);
                        if let Some((entry, restored)) = removed {
                            if let Err(err) = entry.msg.release() {
                                tracing::debug!(%err, "written message was already released");
                            }
                            entry.promise.try_success(());
                            if restored {
                                self.channel.fire_writability(true);
                            }
                        }
                        continue;
                    }
                    let written = self.inner().transport.lock().do_write(&buf);
                    match written {
                        Ok(WriteOutcome::Wrote(n)) => {
                            let restored = self.inner().io.lock().outbound.progress(n, low);
                            if restored {
                                self.channel.fire_writability(true);
                            }
                        }
                        Ok(WriteOutcome::WouldBlock) => {
                            // kernel is full: wait for writable readiness
                            self.channel
                                .update_interest(|ops| ops.with(InterestOps::WRITE));
                            return;
                        }
                        Err(err) => {
                            tracing::debug!(channel = %self.channel.id(), %err, "write failed");
                            self.close_now();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Half-close where supported, full close otherwise.
    pub fn disconnect(&self, promise: ChannelPromise) {
        self.channel.assert_loop();
        let result = self.inner().transport.lock().do_disconnect();
        match result {
            Ok(()) => {
                self.inner().active.store(false, Ordering::Release);
                promise.try_success(());
                self.fire_inactive_once();
            }
            Err(err) if err.kind() == io::ErrorKind::Unsupported => self.close(promise),
            Err(err) => {
                promise.try_failure(err.into());
            }
        }
    }

    /// The close sequence. First caller wins; later calls piggyback on
    /// the same terminal state.
    pub fn close(&self, promise: ChannelPromise) {
        self.channel.assert_loop();
        if self.inner().close_initiated.swap(true, Ordering::AcqRel) {
            let close_future = self.inner().close_promise.future();
            close_future.add_listener(move |_| {
                promise.try_success(());
            });
            return;
        }
        self.inner().open.store(false, Ordering::Release);

        // 1. fail an outstanding connect attempt
        let conn = self.inner().io.lock().connect.take();
        if let Some(conn) = conn {
            if let Some(timeout) = &conn.timeout {
                timeout.cancel();
            }
            conn.promise.try_failure(LongeronError::ClosedChannel);
        }

        // 2. close the transport
        self.inner().active.store(false, Ordering::Release);
        if let Err(err) = self.inner().transport.lock().do_close() {
            tracing::warn!(channel = %self.channel.id(), %err, "transport close failed");
        }

        // 3. fail every pending write
        let entries = self.inner().io.lock().outbound.drain_all();
        fail_entries(entries, &LongeronError::ClosedChannel);

        promise.try_success(());

        // 4. lifecycle events, then leave the reactor
        self.fire_inactive_once();
        self.deregister0(true);
        self.inner().close_promise.try_success(());
        tracing::debug!(channel = %self.channel.id(), "closed");
    }

    /// Close the transport without running the event sequence. Used on
    /// registration failures.
    pub fn close_forcibly(&self) {
        self.inner().open.store(false, Ordering::Release);
        self.inner().active.store(false, Ordering::Release);
        let _ = self.inner().transport.lock().do_close();
    }

    /// Detach from the reactor without closing.
    pub fn deregister(&self, promise: ChannelPromise) {
        self.channel.assert_loop();
        self.deregister0(false);
        promise.try_success(());
    }

    fn deregister0(&self, destroy_pipeline: bool) {
        if !self.inner().registered.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut io = self.inner().io.lock();
            io.read_pending = false;
            if let Some(key) = io.key.take() {
                if key.armed {
                    let mut transport = self.inner().transport.lock();
                    if let (Some(event_loop), Some(source)) =
                        (self.channel.event_loop(), transport.source())
                    {
                        if let Some(registry) = event_loop.registry() {
                            if let Err(err) = registry.deregister(source) {
                                tracing::debug!(channel = %self.channel.id(), %err, "selector deregister failed");
                            }
                        }
                    }
                }
                if let Some(event_loop) = self.channel.event_loop() {
                    event_loop.detach(key.token);
                }
            }
        }
        self.channel.pipeline().fire_channel_unregistered();
        if destroy_pipeline {
            self.channel.pipeline().destroy();
        }
    }

    /// `channel_inactive` fires exactly once per channel, on the first
    /// of disconnect/close to get here, whether or not the channel ever
    /// became active.
    fn fire_inactive_once(&self) {
        if !self.inner().inactive_fired.swap(true, Ordering::AcqRel) {
            self.channel.pipeline().fire_channel_inactive();
        }
    }

    fn close_now(&self) {
        self.close(Promise::new());
    }
}

fn map_connect_error(err: io::Error, remote: SocketAddr) -> LongeronError {
    if err.kind() == io::ErrorKind::ConnectionRefused {
        LongeronError::ConnectRefused(remote)
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ids_are_unique_and_ordered() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert!(b > a);
        assert_ne!(format!("{a}"), format!("{b}"));
    }
}
