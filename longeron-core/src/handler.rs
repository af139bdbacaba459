//! Channel handlers.
//!
//! Handlers come in two capabilities: inbound (events flowing from the
//! socket toward the user) and outbound (operations flowing from the
//! user toward the socket). A type may implement both; [`HandlerBox`]
//! erases the concrete type and records the capability bits the pipeline
//! uses to skip non-participants during propagation.
//!
//! Every callback returns a `Result`. An `Err` from an inbound callback
//! is funneled into `exception_caught` at the next inbound context; an
//! `Err` from an outbound operation fails that operation's promise.
//! Default implementations forward the event to the next participant.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::channel::ChannelPromise;
use crate::context::Context;
use crate::error::{LongeronError, Result};
use crate::message::Message;

/// An application-defined event broadcast through the pipeline.
pub type UserEvent = Box<dyn Any + Send>;

/// Lifecycle callbacks shared by both capabilities.
pub trait ChannelHandler: Send + Sync + 'static {
    /// Invoked on the handler's executor before any event reaches it.
    fn handler_added(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Invoked after the handler left the pipeline (or the pipeline was
    /// torn down), if `handler_added` ran.
    fn handler_removed(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

/// Events flowing head -> tail.
pub trait InboundHandler: ChannelHandler {
    fn channel_registered(&self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn channel_read(&self, ctx: &Context, msg: Message) -> Result<()> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    fn channel_writability_changed(&self, ctx: &Context, writable: bool) -> Result<()> {
        ctx.fire_channel_writability_changed(writable);
        Ok(())
    }

    fn user_event(&self, ctx: &Context, event: UserEvent) -> Result<()> {
        ctx.fire_user_event(event);
        Ok(())
    }

    fn exception_caught(&self, ctx: &Context, cause: LongeronError) -> Result<()> {
        ctx.fire_exception_caught(cause);
        Ok(())
    }
}

/// Operations flowing tail -> head. The head sentinel terminates each of
/// these by calling into the channel's low-level contract.
pub trait OutboundHandler: ChannelHandler {
    fn bind(&self, ctx: &Context, addr: SocketAddr, promise: ChannelPromise) -> Result<()> {
        ctx.bind(addr, promise);
        Ok(())
    }

    fn connect(
        &self,
        ctx: &Context,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) -> Result<()> {
        ctx.connect(remote, local, promise);
        Ok(())
    }

    fn disconnect(&self, ctx: &Context, promise: ChannelPromise) -> Result<()> {
        ctx.disconnect(promise);
        Ok(())
    }

    fn close(&self, ctx: &Context, promise: ChannelPromise) -> Result<()> {
        ctx.close(promise);
        Ok(())
    }

    fn deregister(&self, ctx: &Context, promise: ChannelPromise) -> Result<()> {
        ctx.deregister(promise);
        Ok(())
    }

    /// Request the next read batch (the autoread floor, or an explicit
    /// `read()` when autoread is off).
    fn read(&self, ctx: &Context) -> Result<()> {
        ctx.read();
        Ok(())
    }

    fn write(&self, ctx: &Context, msg: Message, promise: ChannelPromise) -> Result<()> {
        ctx.write_with_promise(msg, promise);
        Ok(())
    }

    fn flush(&self, ctx: &Context) -> Result<()> {
        ctx.flush();
        Ok(())
    }
}

/// A type-erased handler plus its capability bits.
#[derive(Clone)]
pub struct HandlerBox {
    inbound: Option<Arc<dyn InboundHandler>>,
    outbound: Option<Arc<dyn OutboundHandler>>,
    label: &'static str,
}

impl HandlerBox {
    /// Wrap an inbound-only handler.
    pub fn inbound<H: InboundHandler>(handler: H) -> Self {
        Self {
            inbound: Some(Arc::new(handler)),
            outbound: None,
            label: std::any::type_name::<H>(),
        }
    }

    /// Wrap an outbound-only handler.
    pub fn outbound<H: OutboundHandler>(handler: H) -> Self {
        Self {
            inbound: None,
            outbound: Some(Arc::new(handler)),
            label: std::any::type_name::<H>(),
        }
    }

    /// Wrap a handler participating in both directions.
    pub fn duplex<H: InboundHandler + OutboundHandler>(handler: H) -> Self {
        let handler = Arc::new(handler);
        Self {
            inbound: Some(handler.clone()),
            outbound: Some(handler),
            label: std::any::type_name::<H>(),
        }
    }

    #[must_use]
    pub fn is_inbound(&self) -> bool {
        self.inbound.is_some()
    }

    #[must_use]
    pub fn is_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    pub(crate) fn inbound_ref(&self) -> Option<&Arc<dyn InboundHandler>> {
        self.inbound.as_ref()
    }

    pub(crate) fn outbound_ref(&self) -> Option<&Arc<dyn OutboundHandler>> {
        self.outbound.as_ref()
    }

    /// Lifecycle dispatch. For duplex handlers both fields hold the same
    /// object; the inbound side wins so the callback runs once.
    pub(crate) fn handler_added(&self, ctx: &Context) -> Result<()> {
        if let Some(inbound) = &self.inbound {
            inbound.handler_added(ctx)
        } else if let Some(outbound) = &self.outbound {
            outbound.handler_added(ctx)
        } else {
            Ok(())
        }
    }

    pub(crate) fn handler_removed(&self, ctx: &Context) -> Result<()> {
        if let Some(inbound) = &self.inbound {
            inbound.handler_removed(ctx)
        } else if let Some(outbound) = &self.outbound {
            outbound.handler_removed(ctx)
        } else {
            Ok(())
        }
    }

    /// Short type label used for generated context names.
    pub(crate) fn short_label(&self) -> &'static str {
        self.label.rsplit("::").next().unwrap_or(self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inbound;
    impl ChannelHandler for Inbound {}
    impl InboundHandler for Inbound {}

    struct Both;
    impl ChannelHandler for Both {}
    impl InboundHandler for Both {}
    impl OutboundHandler for Both {}

    #[test]
    fn test_capability_bits() {
        let inbound = HandlerBox::inbound(Inbound);
        assert!(inbound.is_inbound());
        assert!(!inbound.is_outbound());

        let duplex = HandlerBox::duplex(Both);
        assert!(duplex.is_inbound());
        assert!(duplex.is_outbound());
    }

    #[test]
    fn test_short_label() {
        let boxed = HandlerBox::inbound(Inbound);
        assert_eq!(boxed.short_label(), "Inbound");
    }
}
