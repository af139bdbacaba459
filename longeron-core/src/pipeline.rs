//! The per-channel handler pipeline.
//!
//! A doubly-linked chain of [`Context`]s between two permanent
//! sentinels. `head` is the outbound floor: every outbound operation
//! that reaches it is handed to the channel's low-level contract. `tail`
//! is the inbound ceiling: events nobody consumed are logged and
//! reference-counted messages released so an inattentive pipeline cannot
//! leak buffers.
//!
//! Handlers added before the channel is registered have their
//! `handler_added` callbacks deferred until registration, which is what
//! makes the observed order `handler_added`, `channel_registered`,
//! `channel_active` hold for handlers installed by an initializer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelFuture, ChannelInner, ChannelPromise};
use crate::context::{
    invoke_handler_added, invoke_handler_removed, invoke_inbound, Context, ContextInner,
    InboundEvent,
};
use crate::error::{LongeronError, Result};
use crate::executor::EventExecutor;
use crate::handler::{ChannelHandler, HandlerBox, InboundHandler, OutboundHandler, UserEvent};
use crate::message::Message;

pub(crate) struct PipelineInner {
    pub(crate) channel: Weak<ChannelInner>,
    pub(crate) head: Arc<ContextInner>,
    pub(crate) tail: Arc<ContextInner>,
    /// Name -> context for user handlers; also the chain-mutation lock.
    registry: Mutex<HashMap<String, Arc<ContextInner>>>,
    /// Set once the channel registers; gates deferred lifecycle callbacks.
    registered: AtomicBool,
    pending: Mutex<Vec<Pending>>,
    name_seq: AtomicUsize,
}

enum Pending {
    Added(Arc<ContextInner>),
    Removed(Arc<ContextInner>),
}

impl PipelineInner {
    pub(crate) fn channel(&self) -> Option<Channel> {
        self.channel.upgrade().map(Channel::from_inner)
    }
}

/// The ordered, mutable handler chain attached to one channel.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub(crate) fn new(channel: Weak<ChannelInner>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PipelineInner>| {
            let head = ContextInner::new(
                "head".to_string(),
                HandlerBox::duplex(HeadHandler),
                weak.clone(),
                None,
            );
            let tail = ContextInner::new(
                "tail".to_string(),
                HandlerBox::inbound(TailHandler),
                weak.clone(),
                None,
            );
            *head.next.lock() = Some(tail.clone());
            *tail.prev.lock() = Arc::downgrade(&head);
            PipelineInner {
                channel,
                head,
                tail,
                registry: Mutex::new(HashMap::new()),
                registered: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
                name_seq: AtomicUsize::new(0),
            }
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<PipelineInner>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn channel(&self) -> Option<Channel> {
        self.inner.channel()
    }

    // --- chain mutation ---

    /// Append a handler just before the tail sentinel.
    pub fn add_last(&self, name: Option<&str>, handler: HandlerBox) -> Result<()> {
        self.add_last_exec(name, handler, None)
    }

    /// Append a handler with an executor override: its callbacks run on
    /// `executor` instead of the channel's reactor.
    pub fn add_last_exec(
        &self,
        name: Option<&str>,
        handler: HandlerBox,
        executor: Option<Arc<dyn EventExecutor>>,
    ) -> Result<()> {
        let before = self.inner.tail.clone();
        self.insert_before(before, name, handler, executor)
    }

    /// Prepend a handler just after the head sentinel.
    pub fn add_first(&self, name: Option<&str>, handler: HandlerBox) -> Result<()> {
        let before = self
            .inner
            .head
            .next
            .lock()
            .clone()
            .expect("chain has a tail");
        self.insert_before(before, name, handler, None)
    }

    /// Insert just before the named handler.
    pub fn add_before(&self, base: &str, name: Option<&str>, handler: HandlerBox) -> Result<()> {
        let base = self
            .inner
            .registry
            .lock()
            .get(base)
            .cloned()
            .ok_or(LongeronError::IllegalState("no such handler"))?;
        self.insert_before(base, name, handler, None)
    }

    /// Insert just after the named handler.
    pub fn add_after(&self, base: &str, name: Option<&str>, handler: HandlerBox) -> Result<()> {
        let after = {
            let registry = self.inner.registry.lock();
            let base = registry
                .get(base)
                .ok_or(LongeronError::IllegalState("no such handler"))?;
            let next = base.next.lock().clone().expect("chain has a tail");
            next
        };
        self.insert_before(after, name, handler, None)
    }

    fn insert_before(
        &self,
        before: Arc<ContextInner>,
        name: Option<&str>,
        handler: HandlerBox,
        executor: Option<Arc<dyn EventExecutor>>,
    ) -> Result<()> {
        let name = match name {
            Some(name) => name.to_string(),
            None => format!(
                "{}#{}",
                handler.short_label(),
                self.inner.name_seq.fetch_add(1, Ordering::Relaxed)
            ),
        };
        let ctx = ContextInner::new(
            name.clone(),
            handler,
            Arc::downgrade(&self.inner),
            executor,
        );
        {
            let mut registry = self.inner.registry.lock();
            if registry.contains_key(&name) {
                return Err(LongeronError::IllegalState("duplicate handler name"));
            }
            let prev = before.prev.lock().upgrade().expect("chain intact");
            *ctx.prev.lock() = Arc::downgrade(&prev);
            *ctx.next.lock() = Some(before.clone());
            *prev.next.lock() = Some(ctx.clone());
            *before.prev.lock() = Arc::downgrade(&ctx);
            registry.insert(name, ctx.clone());
        }
        self.on_added(ctx);
        Ok(())
    }

    /// Remove the named handler. The chain closes around it; in-flight
    /// events skip it from then on.
    pub fn remove(&self, name: &str) -> Result<()> {
        let ctx = {
            let mut registry = self.inner.registry.lock();
            let ctx = registry
                .remove(name)
                .ok_or(LongeronError::IllegalState("no such handler"))?;
            unlink(&ctx);
            ctx
        };
        self.on_removed(ctx);
        Ok(())
    }

    /// Swap the named handler for a new one in the same position.
    pub fn replace(&self, old: &str, name: Option<&str>, handler: HandlerBox) -> Result<()> {
        let replacement_name = match name {
            Some(name) => name.to_string(),
            None => format!(
                "{}#{}",
                handler.short_label(),
                self.inner.name_seq.fetch_add(1, Ordering::Relaxed)
            ),
        };
        let (old_ctx, new_ctx) = {
            let mut registry = self.inner.registry.lock();
            let old_ctx = registry
                .remove(old)
                .ok_or(LongeronError::IllegalState("no such handler"))?;
            if registry.contains_key(&replacement_name) {
                registry.insert(old.to_string(), old_ctx);
                return Err(LongeronError::IllegalState("duplicate handler name"));
            }
            let new_ctx = ContextInner::new(
                replacement_name.clone(),
                handler,
                Arc::downgrade(&self.inner),
                None,
            );
            let prev = old_ctx.prev.lock().upgrade().expect("chain intact");
            let next = old_ctx.next.lock().clone().expect("chain intact");
            *new_ctx.prev.lock() = Arc::downgrade(&prev);
            *new_ctx.next.lock() = Some(next.clone());
            *prev.next.lock() = Some(new_ctx.clone());
            *next.prev.lock() = Arc::downgrade(&new_ctx);
            old_ctx.removed.store(true, Ordering::Release);
            registry.insert(replacement_name, new_ctx.clone());
            (old_ctx, new_ctx)
        };
        self.on_added(new_ctx);
        self.on_removed(old_ctx);
        Ok(())
    }

    /// Look up a handler context by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Context> {
        self.inner
            .registry
            .lock()
            .get(name)
            .map(|ctx| Context { inner: ctx.clone() })
    }

    /// First user context (closest to the head), if any.
    #[must_use]
    pub fn first_context(&self) -> Option<Context> {
        let next = self.inner.head.next.lock().clone()?;
        if Arc::ptr_eq(&next, &self.inner.tail) {
            None
        } else {
            Some(Context { inner: next })
        }
    }

    /// Last user context (closest to the tail), if any.
    #[must_use]
    pub fn last_context(&self) -> Option<Context> {
        let prev = self.inner.tail.prev.lock().upgrade()?;
        if Arc::ptr_eq(&prev, &self.inner.head) {
            None
        } else {
            Some(Context { inner: prev })
        }
    }

    /// Handler names in chain order, sentinels excluded.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut cursor = self.inner.head.next.lock().clone();
        while let Some(ctx) = cursor {
            if Arc::ptr_eq(&ctx, &self.inner.tail) {
                break;
            }
            names.push(ctx.name.clone());
            cursor = ctx.next.lock().clone();
        }
        names
    }

    fn on_added(&self, ctx: Arc<ContextInner>) {
        if !self.inner.registered.load(Ordering::Acquire) {
            self.inner.pending.lock().push(Pending::Added(ctx));
            return;
        }
        invoke_handler_added(ctx);
    }

    fn on_removed(&self, ctx: Arc<ContextInner>) {
        if !self.inner.registered.load(Ordering::Acquire) {
            self.inner.pending.lock().push(Pending::Removed(ctx));
            return;
        }
        invoke_handler_removed(ctx);
    }

    /// Run deferred `handler_added`/`handler_removed` callbacks, in the
    /// order the mutations happened. Called by the channel immediately
    /// before `channel_registered` fires.
    pub(crate) fn invoke_handler_added_if_needed(&self) {
        if self.inner.registered.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = std::mem::take(&mut *self.inner.pending.lock());
        for item in pending {
            match item {
                Pending::Added(ctx) => invoke_handler_added(ctx),
                Pending::Removed(ctx) => invoke_handler_removed(ctx),
            }
        }
    }

    /// Tear the chain down after `channel_unregistered`: every user
    /// handler is removed, tail-most first.
    pub(crate) fn destroy(&self) {
        loop {
            let ctx = {
                let mut registry = self.inner.registry.lock();
                let Some(last) = self.last_user_context() else {
                    break;
                };
                registry.remove(&last.name);
                unlink(&last);
                last
            };
            invoke_handler_removed(ctx);
        }
    }

    fn last_user_context(&self) -> Option<Arc<ContextInner>> {
        let prev = self.inner.tail.prev.lock().upgrade()?;
        if Arc::ptr_eq(&prev, &self.inner.head) {
            None
        } else {
            Some(prev)
        }
    }

    // --- inbound entry points (reactor -> handlers) ---

    pub fn fire_channel_registered(&self) {
        invoke_inbound(self.inner.head.clone(), InboundEvent::Registered);
    }

    pub fn fire_channel_unregistered(&self) {
        invoke_inbound(self.inner.head.clone(), InboundEvent::Unregistered);
    }

    pub fn fire_channel_active(&self) {
        invoke_inbound(self.inner.head.clone(), InboundEvent::Active);
    }

    pub fn fire_channel_inactive(&self) {
        invoke_inbound(self.inner.head.clone(), InboundEvent::Inactive);
    }

    pub fn fire_channel_read(&self, msg: Message) {
        invoke_inbound(self.inner.head.clone(), InboundEvent::Read(msg));
    }

    pub fn fire_channel_read_complete(&self) {
        invoke_inbound(self.inner.head.clone(), InboundEvent::ReadComplete);
    }

    pub fn fire_channel_writability_changed(&self, writable: bool) {
        invoke_inbound(
            self.inner.head.clone(),
            InboundEvent::WritabilityChanged(writable),
        );
    }

    pub fn fire_user_event(&self, event: UserEvent) {
        invoke_inbound(self.inner.head.clone(), InboundEvent::User(event));
    }

    pub fn fire_exception_caught(&self, cause: LongeronError) {
        invoke_inbound(self.inner.head.clone(), InboundEvent::Exception(cause));
    }

    // --- outbound entry points (user -> socket) ---

    fn tail_ctx(&self) -> Context {
        Context {
            inner: self.inner.tail.clone(),
        }
    }

    pub fn bind(&self, addr: SocketAddr, promise: ChannelPromise) {
        self.tail_ctx().bind(addr, promise);
    }

    pub fn connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) {
        self.tail_ctx().connect(remote, local, promise);
    }

    pub fn disconnect(&self, promise: ChannelPromise) {
        self.tail_ctx().disconnect(promise);
    }

    pub fn close(&self, promise: ChannelPromise) {
        self.tail_ctx().close(promise);
    }

    pub fn deregister(&self, promise: ChannelPromise) {
        self.tail_ctx().deregister(promise);
    }

    pub fn read(&self) {
        self.tail_ctx().read();
    }

    pub fn write(&self, msg: Message) -> ChannelFuture {
        self.tail_ctx().write(msg)
    }

    pub fn write_with_promise(&self, msg: Message, promise: ChannelPromise) {
        self.tail_ctx().write_with_promise(msg, promise);
    }

    pub fn flush(&self) {
        self.tail_ctx().flush();
    }

    pub fn write_and_flush(&self, msg: Message) -> ChannelFuture {
        self.tail_ctx().write_and_flush(msg)
    }
}

fn unlink(ctx: &Arc<ContextInner>) {
    let prev = ctx.prev.lock().upgrade().expect("chain intact");
    let next = ctx.next.lock().clone().expect("chain intact");
    *prev.next.lock() = Some(next.clone());
    *next.prev.lock() = Arc::downgrade(&prev);
    ctx.removed.store(true, Ordering::Release);
}

/// Outbound floor and autoread driver.
struct HeadHandler;

impl ChannelHandler for HeadHandler {}

impl InboundHandler for HeadHandler {
    fn channel_active(&self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_active();
        read_if_auto(ctx);
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_read_complete();
        read_if_auto(ctx);
        Ok(())
    }
}

impl OutboundHandler for HeadHandler {
    fn bind(&self, ctx: &Context, addr: SocketAddr, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.internal().bind(addr, promise),
            None => {
                promise.try_failure(LongeronError::ClosedChannel);
            }
        }
        Ok(())
    }

    fn connect(
        &self,
        ctx: &Context,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.internal().connect(remote, local, promise),
            None => {
                promise.try_failure(LongeronError::ClosedChannel);
            }
        }
        Ok(())
    }

    fn disconnect(&self, ctx: &Context, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.internal().disconnect(promise),
            None => {
                promise.try_failure(LongeronError::ClosedChannel);
            }
        }
        Ok(())
    }

    fn close(&self, ctx: &Context, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.internal().close(promise),
            None => {
                promise.try_success(());
            }
        }
        Ok(())
    }

    fn deregister(&self, ctx: &Context, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.internal().deregister(promise),
            None => {
                promise.try_success(());
            }
        }
        Ok(())
    }

    fn read(&self, ctx: &Context) -> Result<()> {
        if let Some(channel) = ctx.channel() {
            channel.internal().begin_read();
        }
        Ok(())
    }

    fn write(&self, ctx: &Context, msg: Message, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.internal().write(msg, promise),
            None => {
                let _ = msg.release();
                promise.try_failure(LongeronError::ClosedChannel);
            }
        }
        Ok(())
    }

    fn flush(&self, ctx: &Context) -> Result<()> {
        if let Some(channel) = ctx.channel() {
            channel.internal().flush();
        }
        Ok(())
    }
}

fn read_if_auto(ctx: &Context) {
    if let Some(channel) = ctx.channel() {
        if channel.config().is_auto_read() {
            channel.read();
        }
    }
}

/// Inbound ceiling: log-and-drop defaults, releasing refcounted
/// messages so unconsumed reads cannot leak.
struct TailHandler;

impl ChannelHandler for TailHandler {}

impl InboundHandler for TailHandler {
    fn channel_registered(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn channel_unregistered(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn channel_active(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn channel_inactive(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn channel_read(&self, _ctx: &Context, msg: Message) -> Result<()> {
        tracing::debug!(?msg, "unhandled message reached the pipeline tail; releasing");
        if let Err(err) = msg.release() {
            tracing::debug!(%err, "unhandled message was already released");
        }
        Ok(())
    }

    fn channel_read_complete(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn channel_writability_changed(&self, _ctx: &Context, _writable: bool) -> Result<()> {
        Ok(())
    }

    fn user_event(&self, _ctx: &Context, _event: UserEvent) -> Result<()> {
        tracing::debug!("unhandled user event reached the pipeline tail");
        Ok(())
    }

    fn exception_caught(&self, _ctx: &Context, cause: LongeronError) -> Result<()> {
        tracing::warn!(%cause, "unhandled exception reached the pipeline tail");
        Ok(())
    }
}
