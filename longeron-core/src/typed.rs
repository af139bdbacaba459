//! Type-matched inbound handling.
//!
//! [`TypedInboundHandler`] delegates messages of one payload type to a
//! typed callback and forwards everything else untouched. With
//! `auto_release` (the default) a matched message is released after the
//! callback returns, normally or not; unmatched messages are never
//! released here, since the next handler owns them.

use std::marker::PhantomData;

use crate::context::Context;
use crate::error::Result;
use crate::handler::{ChannelHandler, InboundHandler};
use crate::message::Message;

pub struct TypedInboundHandler<T, F>
where
    T: std::any::Any + Send + 'static,
    F: Fn(&Context, &T) -> Result<()> + Send + Sync + 'static,
{
    on_message: F,
    auto_release: bool,
    _payload: PhantomData<fn(T)>,
}

impl<T, F> TypedInboundHandler<T, F>
where
    T: std::any::Any + Send + 'static,
    F: Fn(&Context, &T) -> Result<()> + Send + Sync + 'static,
{
    pub fn new(on_message: F) -> Self {
        Self {
            on_message,
            auto_release: true,
            _payload: PhantomData,
        }
    }

    /// Keep matched messages alive after the callback (the callback
    /// takes over the reference).
    #[must_use]
    pub fn without_auto_release(mut self) -> Self {
        self.auto_release = false;
        self
    }
}

impl<T, F> ChannelHandler for TypedInboundHandler<T, F>
where
    T: std::any::Any + Send + 'static,
    F: Fn(&Context, &T) -> Result<()> + Send + Sync + 'static,
{
}

impl<T, F> InboundHandler for TypedInboundHandler<T, F>
where
    T: std::any::Any + Send + 'static,
    F: Fn(&Context, &T) -> Result<()> + Send + Sync + 'static,
{
    fn channel_read(&self, ctx: &Context, msg: Message) -> Result<()> {
        if !msg.is::<T>() {
            ctx.fire_channel_read(msg);
            return Ok(());
        }
        let outcome = {
            let payload = msg.downcast_ref::<T>().expect("payload type checked");
            (self.on_message)(ctx, payload)
        };
        if self.auto_release {
            if let Err(err) = msg.release() {
                tracing::debug!(%err, "typed message was already released");
            }
        }
        outcome
    }
}
