//! Client bootstrap.
//!
//! [`Bootstrap`] assembles the pieces a client connection needs: the
//! event-loop group, channel options, a handler (usually a
//! `ChannelInitializer`), and an address resolver. `connect` then runs
//! the staged sequence
//!
//! 1. create the channel and install the handler,
//! 2. register it with the group's next reactor,
//! 3. resolve the remote address on that reactor,
//! 4. drive the channel's connect protocol,
//!
//! failing the returned future at whichever stage breaks, and closing
//! the partially-set-up channel when one does.

use std::net::SocketAddr;
use std::sync::Arc;

use longeron_core::channel::Channel;
use longeron_core::config::ChannelOptions;
use longeron_core::error::LongeronError;
use longeron_core::future::{Future, Promise};
use longeron_core::handler::HandlerBox;
use longeron_core::reactor::EventLoopGroup;
use longeron_tcp::TcpSocketOptions;

use crate::resolver::{AddressResolver, StdResolver};

type ChannelFactory = Arc<dyn Fn(&ChannelOptions) -> Channel + Send + Sync>;

/// Builder that creates, registers, and connects client channels.
///
/// A configured bootstrap is reusable: each `connect` produces an
/// independent channel over a fresh transport.
#[derive(Clone)]
pub struct Bootstrap {
    group: Option<Arc<EventLoopGroup>>,
    options: ChannelOptions,
    socket_options: TcpSocketOptions,
    factory: Option<ChannelFactory>,
    handler: Option<HandlerBox>,
    resolver: Arc<dyn AddressResolver>,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl Bootstrap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            group: None,
            options: ChannelOptions::default(),
            socket_options: TcpSocketOptions::default(),
            factory: None,
            handler: None,
            resolver: Arc::new(StdResolver),
        }
    }

    /// The reactor group that will own connected channels.
    #[must_use]
    pub fn with_group(mut self, group: Arc<EventLoopGroup>) -> Self {
        self.group = Some(group);
        self
    }

    /// Channel options applied to every connect.
    #[must_use]
    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    /// TCP socket options for the default transport.
    #[must_use]
    pub fn with_socket_options(mut self, socket_options: TcpSocketOptions) -> Self {
        self.socket_options = socket_options;
        self
    }

    /// The handler installed into each new channel's pipeline, normally
    /// a `ChannelInitializer`.
    #[must_use]
    pub fn with_handler(mut self, handler: HandlerBox) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Substitute the transport: the factory returns a fresh
    /// unregistered channel per connect. Defaults to `longeron-tcp`.
    #[must_use]
    pub fn with_channel_factory(
        mut self,
        factory: impl Fn(&ChannelOptions) -> Channel + Send + Sync + 'static,
    ) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Substitute the address resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: impl AddressResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Connect to `host:port`, resolving the name on the channel's
    /// reactor. The returned future yields the connected channel.
    pub fn connect(&self, host: &str, port: u16) -> Future<Channel> {
        self.run_connect(Remote::Name(host.to_string(), port))
    }

    /// Connect to an already-resolved address.
    pub fn connect_addr(&self, addr: SocketAddr) -> Future<Channel> {
        self.run_connect(Remote::Addr(addr))
    }

    fn run_connect(&self, remote: Remote) -> Future<Channel> {
        let completion: Promise<Channel> = Promise::new();

        let Some(group) = self.group.clone() else {
            completion.try_failure(LongeronError::IllegalState("bootstrap has no group"));
            return completion.future();
        };
        let Some(handler) = self.handler.clone() else {
            completion.try_failure(LongeronError::IllegalState("bootstrap has no handler"));
            return completion.future();
        };

        let channel = match &self.factory {
            Some(factory) => factory(&self.options),
            None => longeron_tcp::tcp_channel_with(&self.options, self.socket_options.clone()),
        };
        if let Err(err) = channel.pipeline().add_last(None, handler) {
            completion.try_failure(err);
            return completion.future();
        }

        let resolver = self.resolver.clone();
        let register_future = group.register(&channel);
        let registered_channel = channel.clone();
        let register_completion = completion.clone();
        register_future.add_listener(move |registration| {
            if let Some(cause) = registration.cause() {
                register_completion.try_failure(cause);
                registered_channel.close();
                return;
            }
            // registration ran on the assigned reactor; so does this
            resolve_and_connect(&registered_channel, &resolver, &remote, &register_completion);
        });

        completion.future()
    }
}

enum Remote {
    Name(String, u16),
    Addr(SocketAddr),
}

fn resolve_and_connect(
    channel: &Channel,
    resolver: &Arc<dyn AddressResolver>,
    remote: &Remote,
    completion: &Promise<Channel>,
) {
    let addr = match remote {
        Remote::Addr(addr) => *addr,
        Remote::Name(host, port) => match resolver.resolve(host, *port) {
            Ok(addr) => addr,
            Err(err) => {
                completion.try_failure(err);
                channel.close();
                return;
            }
        },
    };
    let connect_channel = channel.clone();
    let connect_completion = completion.clone();
    channel.connect(addr).add_listener(move |connected| {
        match connected.cause() {
            Some(cause) => {
                connect_completion.try_failure(cause);
                connect_channel.close();
            }
            None => {
                connect_completion.try_success(connect_channel.clone());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_without_group_fails_fast() {
        let bootstrap = Bootstrap::new().with_handler(HandlerBox::inbound(
            longeron_core::initializer::ChannelInitializer::new(|_channel: &Channel| Ok(())),
        ));
        let future = bootstrap.connect_addr("127.0.0.1:1".parse().unwrap());
        assert!(matches!(
            future.cause(),
            Some(LongeronError::IllegalState(_))
        ));
    }

    #[test]
    fn test_connect_without_handler_fails_fast() {
        let group = Arc::new(EventLoopGroup::with_name(1, "bootstrap-test").unwrap());
        let bootstrap = Bootstrap::new().with_group(group.clone());
        let future = bootstrap.connect_addr("127.0.0.1:1".parse().unwrap());
        assert!(matches!(
            future.cause(),
            Some(LongeronError::IllegalState(_))
        ));
        group.shutdown_gracefully(
            std::time::Duration::ZERO,
            std::time::Duration::from_secs(1),
        );
    }
}
