//! Handler contexts and event propagation.
//!
//! A [`Context`] is a handler's position in its pipeline: name, neighbor
//! links, capability bits, and the executor its callbacks run on (the
//! channel's reactor unless overridden at registration). Inbound events
//! walk toward the tail, outbound operations toward the head, skipping
//! contexts that lack the direction's capability. When the next hop
//! belongs to a different executor the event is re-queued there, so a
//! handler only ever observes events on its own executor.
//!
//! Failures follow the funnel rules: an inbound callback error becomes
//! `exception_caught` at the next inbound context; an outbound error
//! fails the operation's promise and never re-enters the inbound path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::channel::{Channel, ChannelFuture, ChannelPromise};
use crate::error::{LongeronError, Result};
use crate::executor::EventExecutor;
use crate::future::Promise;
use crate::handler::{HandlerBox, InboundHandler, OutboundHandler, UserEvent};
use crate::message::Message;
use crate::pipeline::{Pipeline, PipelineInner};

pub(crate) struct ContextInner {
    pub(crate) name: String,
    pub(crate) handler: HandlerBox,
    pub(crate) pipeline: Weak<PipelineInner>,
    pub(crate) executor_override: Option<Arc<dyn EventExecutor>>,
    pub(crate) next: Mutex<Option<Arc<ContextInner>>>,
    pub(crate) prev: Mutex<Weak<ContextInner>>,
    pub(crate) removed: AtomicBool,
    pub(crate) added: AtomicBool,
}

impl ContextInner {
    pub(crate) fn new(
        name: String,
        handler: HandlerBox,
        pipeline: Weak<PipelineInner>,
        executor_override: Option<Arc<dyn EventExecutor>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            handler,
            pipeline,
            executor_override,
            next: Mutex::new(None),
            prev: Mutex::new(Weak::new()),
            removed: AtomicBool::new(false),
            added: AtomicBool::new(false),
        })
    }

    fn channel(&self) -> Option<Channel> {
        self.pipeline.upgrade().and_then(|p| p.channel())
    }

    fn executor(&self) -> Option<Arc<dyn EventExecutor>> {
        if let Some(executor) = &self.executor_override {
            return Some(executor.clone());
        }
        self.channel().and_then(|ch| ch.executor())
    }
}

/// A handler's view of its channel and pipeline.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl Context {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn pipeline(&self) -> Option<Pipeline> {
        self.inner.pipeline.upgrade().map(Pipeline::from_inner)
    }

    #[must_use]
    pub fn channel(&self) -> Option<Channel> {
        self.inner.channel()
    }

    /// The executor this context's callbacks run on, once the channel is
    /// registered.
    #[must_use]
    pub fn executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.inner.executor()
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::Acquire)
    }

    /// A promise whose listeners run on the channel's executor.
    #[must_use]
    pub fn new_promise(&self) -> ChannelPromise {
        match self.inner.executor() {
            Some(executor) => Promise::with_executor(executor),
            None => Promise::new(),
        }
    }

    // --- inbound propagation ---

    pub fn fire_channel_registered(&self) {
        self.fire(InboundEvent::Registered);
    }

    pub fn fire_channel_unregistered(&self) {
        self.fire(InboundEvent::Unregistered);
    }

    pub fn fire_channel_active(&self) {
        self.fire(InboundEvent::Active);
    }

    pub fn fire_channel_inactive(&self) {
        self.fire(InboundEvent::Inactive);
    }

    pub fn fire_channel_read(&self, msg: Message) {
        self.fire(InboundEvent::Read(msg));
    }

    pub fn fire_channel_read_complete(&self) {
        self.fire(InboundEvent::ReadComplete);
    }

    pub fn fire_channel_writability_changed(&self, writable: bool) {
        self.fire(InboundEvent::WritabilityChanged(writable));
    }

    pub fn fire_user_event(&self, event: UserEvent) {
        self.fire(InboundEvent::User(event));
    }

    pub fn fire_exception_caught(&self, cause: LongeronError) {
        self.fire(InboundEvent::Exception(cause));
    }

    fn fire(&self, event: InboundEvent) {
        match next_inbound(&self.inner) {
            Some(next) => invoke_inbound(next, event),
            None => drop_inbound_event(event),
        }
    }

    // --- outbound propagation ---

    pub fn bind(&self, addr: SocketAddr, promise: ChannelPromise) {
        self.dispatch(OutboundOp::Bind(addr, promise));
    }

    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: ChannelPromise) {
        self.dispatch(OutboundOp::Connect(remote, local, promise));
    }

    pub fn disconnect(&self, promise: ChannelPromise) {
        self.dispatch(OutboundOp::Disconnect(promise));
    }

    pub fn close(&self, promise: ChannelPromise) {
        self.dispatch(OutboundOp::Close(promise));
    }

    pub fn deregister(&self, promise: ChannelPromise) {
        self.dispatch(OutboundOp::Deregister(promise));
    }

    /// Request the next read batch from this context toward the head.
    pub fn read(&self) {
        self.dispatch(OutboundOp::Read);
    }

    pub fn write_with_promise(&self, msg: Message, promise: ChannelPromise) {
        self.dispatch(OutboundOp::Write(msg, promise));
    }

    pub fn write(&self, msg: Message) -> ChannelFuture {
        let promise = self.new_promise();
        self.write_with_promise(msg, promise.clone());
        promise.future()
    }

    pub fn flush(&self) {
        self.dispatch(OutboundOp::Flush);
    }

    pub fn write_and_flush(&self, msg: Message) -> ChannelFuture {
        let future = self.write(msg);
        self.flush();
        future
    }

    fn dispatch(&self, op: OutboundOp) {
        match prev_outbound(&self.inner) {
            Some(prev) => invoke_outbound(prev, op),
            None => fail_outbound_op(op),
        }
    }
}

// --- events and invocation ---

pub(crate) enum InboundEvent {
    Registered,
    Unregistered,
    Active,
    Inactive,
    Read(Message),
    ReadComplete,
    WritabilityChanged(bool),
    User(UserEvent),
    Exception(LongeronError),
}

pub(crate) enum OutboundOp {
    Bind(SocketAddr, ChannelPromise),
    Connect(SocketAddr, Option<SocketAddr>, ChannelPromise),
    Disconnect(ChannelPromise),
    Close(ChannelPromise),
    Deregister(ChannelPromise),
    Read,
    Write(Message, ChannelPromise),
    Flush,
}

impl OutboundOp {
    fn promise(&self) -> Option<ChannelPromise> {
        match self {
            Self::Bind(_, p)
            | Self::Connect(_, _, p)
            | Self::Disconnect(p)
            | Self::Close(p)
            | Self::Deregister(p)
            | Self::Write(_, p) => Some(p.clone()),
            Self::Read | Self::Flush => None,
        }
    }
}

pub(crate) fn next_inbound(from: &Arc<ContextInner>) -> Option<Arc<ContextInner>> {
    let mut cursor = from.next.lock().clone();
    while let Some(ctx) = cursor {
        if !ctx.removed.load(Ordering::Acquire) && ctx.handler.is_inbound() {
            return Some(ctx);
        }
        cursor = ctx.next.lock().clone();
    }
    None
}

pub(crate) fn prev_outbound(from: &Arc<ContextInner>) -> Option<Arc<ContextInner>> {
    let mut cursor = from.prev.lock().upgrade();
    while let Some(ctx) = cursor {
        if !ctx.removed.load(Ordering::Acquire) && ctx.handler.is_outbound() {
            return Some(ctx);
        }
        cursor = ctx.prev.lock().upgrade();
    }
    None
}

/// Run `event` through `ctx`'s handler, hopping executors if the caller
/// is not on the context's executor.
pub(crate) fn invoke_inbound(ctx: Arc<ContextInner>, event: InboundEvent) {
    match ctx.executor() {
        Some(executor) if !executor.in_event_loop() => {
            executor.execute(Box::new(move || run_inbound(ctx, event)));
        }
        _ => run_inbound(ctx, event),
    }
}

fn run_inbound(ctx: Arc<ContextInner>, event: InboundEvent) {
    if ctx.removed.load(Ordering::Acquire) {
        // removed while the event was in flight: skip to the next hop
        match next_inbound(&ctx) {
            Some(next) => invoke_inbound(next, event),
            None => drop_inbound_event(event),
        }
        return;
    }
    let Some(handler) = ctx.handler.inbound_ref().cloned() else {
        return;
    };
    let context = Context { inner: ctx.clone() };
    let outcome = catch(move || match event {
        InboundEvent::Registered => handler.channel_registered(&context),
        InboundEvent::Unregistered => handler.channel_unregistered(&context),
        InboundEvent::Active => handler.channel_active(&context),
        InboundEvent::Inactive => handler.channel_inactive(&context),
        InboundEvent::Read(msg) => handler.channel_read(&context, msg),
        InboundEvent::ReadComplete => handler.channel_read_complete(&context),
        InboundEvent::WritabilityChanged(writable) => {
            handler.channel_writability_changed(&context, writable)
        }
        InboundEvent::User(event) => handler.user_event(&context, event),
        InboundEvent::Exception(cause) => handler.exception_caught(&context, cause),
    });
    if let Err(cause) = outcome {
        match next_inbound(&ctx) {
            Some(next) => invoke_inbound(next, InboundEvent::Exception(cause)),
            None => tracing::warn!(ctx = %ctx.name, %cause, "exception fell off the pipeline"),
        }
    }
}

pub(crate) fn invoke_outbound(ctx: Arc<ContextInner>, op: OutboundOp) {
    match ctx.executor() {
        Some(executor) if !executor.in_event_loop() => {
            executor.execute(Box::new(move || run_outbound(ctx, op)));
        }
        _ => run_outbound(ctx, op),
    }
}

fn run_outbound(ctx: Arc<ContextInner>, op: OutboundOp) {
    if ctx.removed.load(Ordering::Acquire) {
        match prev_outbound(&ctx) {
            Some(prev) => invoke_outbound(prev, op),
            None => fail_outbound_op(op),
        }
        return;
    }
    let Some(handler) = ctx.handler.outbound_ref().cloned() else {
        return;
    };
    let promise = op.promise();
    let context = Context { inner: ctx.clone() };
    let name = ctx.name.clone();
    let outcome = catch(move || match op {
        OutboundOp::Bind(addr, promise) => handler.bind(&context, addr, promise),
        OutboundOp::Connect(remote, local, promise) => {
            handler.connect(&context, remote, local, promise)
        }
        OutboundOp::Disconnect(promise) => handler.disconnect(&context, promise),
        OutboundOp::Close(promise) => handler.close(&context, promise),
        OutboundOp::Deregister(promise) => handler.deregister(&context, promise),
        OutboundOp::Read => handler.read(&context),
        OutboundOp::Write(msg, promise) => handler.write(&context, msg, promise),
        OutboundOp::Flush => handler.flush(&context),
    });
    if let Err(cause) = outcome {
        match promise {
            Some(promise) => {
                promise.try_failure(cause);
            }
            None => tracing::warn!(ctx = %name, %cause, "outbound operation failed"),
        }
    }
}

/// Lifecycle: `handler_added`, on the context's executor. A failure is
/// funneled like any inbound error.
pub(crate) fn invoke_handler_added(ctx: Arc<ContextInner>) {
    let run = move |ctx: Arc<ContextInner>| {
        if ctx.added.swap(true, Ordering::AcqRel) {
            return;
        }
        let context = Context { inner: ctx.clone() };
        let handler = ctx.handler.clone();
        if let Err(cause) = catch(move || handler.handler_added(&context)) {
            match next_inbound(&ctx) {
                Some(next) => invoke_inbound(next, InboundEvent::Exception(cause)),
                None => tracing::warn!(ctx = %ctx.name, %cause, "handler_added failed"),
            }
        }
    };
    match ctx.executor() {
        Some(executor) if !executor.in_event_loop() => {
            executor.execute(Box::new(move || run(ctx)));
        }
        _ => run(ctx),
    }
}

/// Lifecycle: `handler_removed`, only if `handler_added` ran.
pub(crate) fn invoke_handler_removed(ctx: Arc<ContextInner>) {
    let run = move |ctx: Arc<ContextInner>| {
        if !ctx.added.load(Ordering::Acquire) {
            return;
        }
        let context = Context { inner: ctx.clone() };
        let handler = ctx.handler.clone();
        if let Err(cause) = catch(move || handler.handler_removed(&context)) {
            tracing::warn!(ctx = %ctx.name, %cause, "handler_removed failed");
        }
    };
    match ctx.executor() {
        Some(executor) if !executor.in_event_loop() => {
            executor.execute(Box::new(move || run(ctx)));
        }
        _ => run(ctx),
    }
}

/// Invoke a fallible handler callback, converting panics into errors so
/// one handler cannot take the reactor down.
fn catch(f: impl FnOnce() -> Result<()>) -> Result<()> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(LongeronError::HandlerPanic(panic_text(&payload))),
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn drop_inbound_event(event: InboundEvent) {
    match event {
        InboundEvent::Read(msg) => {
            if let Err(err) = msg.release() {
                tracing::debug!(%err, "discarded message was already released");
            }
            tracing::debug!("message reached a torn-down pipeline");
        }
        InboundEvent::Exception(cause) => {
            tracing::warn!(%cause, "exception reached a torn-down pipeline");
        }
        _ => {}
    }
}

fn fail_outbound_op(op: OutboundOp) {
    if let OutboundOp::Write(msg, _) = &op {
        if let Err(err) = msg.release() {
            tracing::debug!(%err, "unroutable write was already released");
        }
    }
    if let Some(promise) = op.promise() {
        promise.try_failure(LongeronError::ClosedChannel);
    }
}
