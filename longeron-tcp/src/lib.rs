//! # Longeron TCP
//!
//! **Non-blocking TCP transport for the longeron engine.**
//!
//! This crate provides the [`ChannelTransport`] implementation over
//! `mio::net::TcpStream`: the non-blocking connect handshake, the
//! readiness-driven read/write calls, and socket option plumbing via
//! `socket2`. Everything above the socket (the channel state machine,
//! the pipeline, the reactor) lives in `longeron-core`; everything here
//! is the part only TCP knows.
//!
//! Server-side accept loops are out of scope; [`TcpStreamTransport::from_accepted`]
//! exists so an accept-side transport can hand established connections
//! into the same channel machinery.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

use longeron_core::channel::{Channel, ChannelTransport};
use longeron_core::config::ChannelOptions;

mod stream;

pub use stream::{TcpSocketOptions, TcpStreamTransport};

/// A fresh, unregistered client channel over a TCP transport.
///
/// # Examples
///
/// ```no_run
/// use longeron_core::config::ChannelOptions;
/// use longeron_core::reactor::EventLoopGroup;
///
/// let group = EventLoopGroup::new(1).unwrap();
/// let channel = longeron_tcp::tcp_channel(&ChannelOptions::default());
/// group.register(&channel).sync().unwrap();
/// let connect = channel.connect("127.0.0.1:9000".parse().unwrap());
/// connect.sync().unwrap();
/// ```
#[must_use]
pub fn tcp_channel(options: &ChannelOptions) -> Channel {
    tcp_channel_with(options, TcpSocketOptions::default())
}

/// Same as [`tcp_channel`] with explicit socket options.
#[must_use]
pub fn tcp_channel_with(options: &ChannelOptions, socket_options: TcpSocketOptions) -> Channel {
    let transport: Box<dyn ChannelTransport> = Box::new(TcpStreamTransport::new(socket_options));
    Channel::new(transport, options)
}
