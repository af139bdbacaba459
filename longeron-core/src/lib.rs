//! Longeron Core
//!
//! This crate contains the transport engine's building blocks:
//! - Reference-counted buffers and allocator policies (`buffer`, `alloc`)
//! - Write-once promises with listener fan-out (`future`)
//! - Event executors and the quiet-period shutdown protocol (`executor`)
//! - The selector-backed reactor and loop groups (`reactor`)
//! - Channels, the low-level IO contract, and the outbound buffer
//!   (`channel`, `outbound`, `config`)
//! - The handler pipeline (`pipeline`, `context`, `handler`,
//!   `initializer`, `typed`)
//! - A scripted loopback channel for deterministic tests (`embedded`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod alloc;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod context;
pub mod embedded;
pub mod error;
pub mod executor;
pub mod future;
pub mod handler;
pub mod initializer;
pub mod message;
mod outbound;
pub mod pipeline;
pub mod reactor;
pub mod typed;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::alloc::{BufAllocator, PooledAllocator, UnpooledAllocator};
    pub use crate::buffer::ByteBuf;
    pub use crate::channel::{
        Channel, ChannelFuture, ChannelId, ChannelPromise, ChannelTransport, ReadOutcome,
        WriteOutcome,
    };
    pub use crate::config::{
        AdaptiveRecvBufAllocator, ChannelOptions, FixedRecvBufAllocator, RecvBufAllocator,
    };
    pub use crate::context::Context;
    pub use crate::embedded::{ConnectBehavior, EmbeddedChannel, EmbeddedEventLoop};
    pub use crate::error::{LongeronError, Result};
    pub use crate::executor::{Chooser, EventExecutor, SingleThreadExecutor};
    pub use crate::future::{Future, Promise};
    pub use crate::handler::{
        ChannelHandler, HandlerBox, InboundHandler, OutboundHandler, UserEvent,
    };
    pub use crate::initializer::ChannelInitializer;
    pub use crate::message::Message;
    pub use crate::pipeline::Pipeline;
    pub use crate::reactor::{EventLoop, EventLoopGroup, InterestOps, NioEventLoop};
    pub use crate::typed::TypedInboundHandler;
}
