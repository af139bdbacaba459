//! # Longeron
//!
//! An asynchronous, event-driven network transport framework.
//!
//! ## Architecture
//!
//! Longeron is structured as a transport engine with clean layering:
//!
//! - **`longeron-core`**: refcounted buffers, promises, event-loop
//!   groups, the mio-backed reactor, channels, and handler pipelines
//! - **Transport crates**: the socket-specific half behind the
//!   `ChannelTransport` seam (`longeron-tcp` ships in-tree)
//! - **`longeron`**: public API surface (this crate)
//!
//! ## Model
//!
//! Applications compose **channels** out of **handler pipelines**. A
//! small group of **reactor threads** multiplexes readiness across all
//! channels; each channel is affine to exactly one reactor for its
//! lifetime, so handlers never see concurrent events. Outbound writes
//! queue in a per-channel buffer whose watermarks drive `is_writable`;
//! inbound bytes arrive as reference-counted buffers that the pipeline
//! releases when consumed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use longeron::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> longeron::Result<()> {
//!     let group = Arc::new(EventLoopGroup::new(0)?);
//!
//!     let bootstrap = Bootstrap::new()
//!         .with_group(group.clone())
//!         .with_handler(HandlerBox::inbound(ChannelInitializer::new(|channel: &Channel| {
//!             channel.pipeline().add_last(
//!                 Some("printer"),
//!                 HandlerBox::inbound(TypedInboundHandler::<ByteBuf, _>::new(|_ctx, buf| {
//!                     println!("received {} bytes", buf.readable_bytes());
//!                     Ok(())
//!                 })),
//!             )
//!         })));
//!
//!     let channel_future = bootstrap.connect("example.com", 9000);
//!     channel_future.sync()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Testing
//!
//! The `EmbeddedChannel` runs the full engine over a scripted transport
//! on a virtual clock, with no sockets or threads, which is how this
//! workspace tests the state machine itself.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

// Re-export core types
pub use bytes::Bytes;
pub use longeron_core::error::{LongeronError, Result};

mod bootstrap;
mod resolver;

/// Development helpers (benches/tests)
pub mod dev_tracing;

pub use bootstrap::Bootstrap;
pub use resolver::{AddressResolver, StdResolver};

/// The commonly-used surface in one import.
pub mod prelude {
    pub use crate::bootstrap::Bootstrap;
    pub use crate::resolver::{AddressResolver, StdResolver};
    pub use longeron_core::prelude::*;
    pub use longeron_tcp::{tcp_channel, tcp_channel_with, TcpSocketOptions};
}
