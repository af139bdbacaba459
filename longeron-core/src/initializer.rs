//! One-shot pipeline population.
//!
//! A [`ChannelInitializer`] sits in the pipeline until its channel
//! registers, runs its closure exactly once to install the real
//! handlers, and removes itself. The once-only guard is an insert into a
//! shared map keyed by channel id, so the same initializer instance can
//! serve many channels (the bootstrap reuses one across connects).
//!
//! If the closure fails, the error goes down the usual funnel
//! (`exception_caught` at the next inbound context) and the channel is
//! closed: a half-initialized pipeline is not allowed to carry traffic.

use dashmap::DashMap;

use crate::channel::{Channel, ChannelId};
use crate::context::Context;
use crate::error::Result;
use crate::handler::{ChannelHandler, InboundHandler};

/// Installs a channel's handlers on registration, then removes itself.
///
/// # Examples
///
/// ```ignore
/// let initializer = ChannelInitializer::new(|channel: &Channel| {
///     channel.pipeline().add_last(Some("echo"), HandlerBox::inbound(Echo))?;
///     Ok(())
/// });
/// pipeline.add_last(Some("init"), HandlerBox::inbound(initializer))?;
/// ```
pub struct ChannelInitializer<F>
where
    F: Fn(&Channel) -> Result<()> + Send + Sync + 'static,
{
    init: F,
    initialized: DashMap<ChannelId, ()>,
}

impl<F> ChannelInitializer<F>
where
    F: Fn(&Channel) -> Result<()> + Send + Sync + 'static,
{
    pub fn new(init: F) -> Self {
        Self {
            init,
            initialized: DashMap::new(),
        }
    }

    /// Run the closure if this channel has not been initialized yet.
    /// Returns `true` when this call performed the initialization.
    fn init_channel(&self, ctx: &Context) -> bool {
        let Some(channel) = ctx.channel() else {
            return false;
        };
        // insert is the compare-and-swap: only the first caller sees None
        if self.initialized.insert(channel.id(), ()).is_some() {
            return false;
        }
        let outcome = (self.init)(&channel);
        if let Some(pipeline) = ctx.pipeline() {
            if let Err(err) = pipeline.remove(ctx.name()) {
                tracing::debug!(%err, "initializer already removed");
            }
        }
        if let Err(cause) = outcome {
            tracing::warn!(channel = %channel.id(), %cause, "channel initialization failed");
            ctx.fire_exception_caught(cause);
            channel.close();
        }
        true
    }
}

impl<F> ChannelHandler for ChannelInitializer<F>
where
    F: Fn(&Channel) -> Result<()> + Send + Sync + 'static,
{
    fn handler_added(&self, ctx: &Context) -> Result<()> {
        // added to an already-registered channel: initialize right away
        if ctx.channel().is_some_and(|ch| ch.is_registered()) {
            self.init_channel(ctx);
        }
        Ok(())
    }

    fn handler_removed(&self, ctx: &Context) -> Result<()> {
        if let Some(channel) = ctx.channel() {
            self.initialized.remove(&channel.id());
        }
        Ok(())
    }
}

impl<F> InboundHandler for ChannelInitializer<F>
where
    F: Fn(&Channel) -> Result<()> + Send + Sync + 'static,
{
    fn channel_registered(&self, ctx: &Context) -> Result<()> {
        if self.init_channel(ctx) {
            // the chain changed under this event: replay it from the
            // head so the new handlers observe registration
            if let Some(pipeline) = ctx.pipeline() {
                pipeline.fire_channel_registered();
            }
        } else {
            ctx.fire_channel_registered();
        }
        Ok(())
    }
}
