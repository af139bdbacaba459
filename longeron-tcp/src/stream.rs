//! The mio-backed TCP stream transport.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use longeron_core::buffer::ByteBuf;
use longeron_core::channel::{ChannelTransport, ReadOutcome, WriteOutcome};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

#[cfg(target_os = "linux")]
const EINPROGRESS: i32 = 115;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
const EINPROGRESS: i32 = 36;

/// Socket-level options applied when the connection is established.
#[derive(Debug, Clone)]
pub struct TcpSocketOptions {
    /// Disable Nagle's algorithm (TCP_NODELAY). On by default: the
    /// engine batches writes itself through the flush boundary.
    pub nodelay: bool,

    /// Enable TCP keepalive with the given idle time.
    pub keepalive: Option<Duration>,
}

impl Default for TcpSocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: None,
        }
    }
}

impl TcpSocketOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, idle: Duration) -> Self {
        self.keepalive = Some(idle);
        self
    }
}

/// `ChannelTransport` over a non-blocking `mio::net::TcpStream`.
pub struct TcpStreamTransport {
    stream: Option<mio::net::TcpStream>,
    options: TcpSocketOptions,
    /// Local address requested by `do_bind` before the connect.
    bind_addr: Option<SocketAddr>,
    connected: bool,
}

impl TcpStreamTransport {
    #[must_use]
    pub fn new(options: TcpSocketOptions) -> Self {
        Self {
            stream: None,
            options,
            bind_addr: None,
            connected: false,
        }
    }

    /// Wrap a connection produced by an accept loop. The stream must
    /// already be non-blocking.
    #[must_use]
    pub fn from_accepted(stream: mio::net::TcpStream, options: TcpSocketOptions) -> Self {
        Self {
            stream: Some(stream),
            options,
            bind_addr: None,
            connected: true,
        }
    }

    fn apply_options(&self) -> io::Result<()> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        let sock = SockRef::from(stream);
        sock.set_nodelay(self.options.nodelay)?;
        if let Some(idle) = self.options.keepalive {
            sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(idle))?;
        }
        Ok(())
    }

    /// Connect with an explicit local bind. `mio` has no bind-then-
    /// connect path, so this goes through `socket2`; an in-progress
    /// connect surfaces as `EINPROGRESS` and is not an error.
    fn connect_from(local: SocketAddr, remote: SocketAddr) -> io::Result<mio::net::TcpStream> {
        let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;
        match socket.connect(&remote.into()) {
            Ok(()) => {}
            Err(err)
                if err.raw_os_error() == Some(EINPROGRESS)
                    || err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }
        Ok(mio::net::TcpStream::from_std(socket.into()))
    }
}

impl ChannelTransport for TcpStreamTransport {
    fn source(&mut self) -> Option<&mut dyn mio::event::Source> {
        self.stream
            .as_mut()
            .map(|stream| stream as &mut dyn mio::event::Source)
    }

    fn is_active(&self) -> bool {
        self.connected && self.stream.is_some()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    fn do_bind(&mut self, addr: SocketAddr) -> io::Result<()> {
        if self.stream.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "bind after connect",
            ));
        }
        self.bind_addr = Some(addr);
        Ok(())
    }

    fn do_connect(&mut self, remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<bool> {
        if self.stream.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "socket already connected or connecting",
            ));
        }
        let stream = match local.or(self.bind_addr) {
            Some(local) => Self::connect_from(local, remote)?,
            None => mio::net::TcpStream::connect(remote)?,
        };
        tracing::debug!(%remote, "tcp connect started");
        self.stream = Some(stream);
        // completion is always observed through connect readiness
        Ok(false)
    }

    fn do_finish_connect(&mut self) -> io::Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(peer) => {
                tracing::debug!(%peer, "tcp connect established");
                self.connected = true;
                self.apply_options()?;
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "spurious connect readiness"))
            }
            Err(err) => Err(err),
        }
    }

    fn do_close(&mut self) -> io::Result<()> {
        self.connected = false;
        if let Some(stream) = self.stream.take() {
            // a close error is unreportable to anyone useful
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        Ok(())
    }

    fn do_read(&mut self, buf: &ByteBuf) -> io::Result<ReadOutcome> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        if buf.writable_bytes() == 0 {
            buf.ensure_writable(1024)
                .map_err(|err| io::Error::new(io::ErrorKind::OutOfMemory, err.to_string()))?;
        }
        loop {
            let read = buf
                .unwritten(|spare| stream.read(spare))
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
            return match read {
                Ok(0) => Ok(ReadOutcome::Eof),
                Ok(n) => {
                    buf.advance_writer(n)
                        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
                    Ok(ReadOutcome::Data(n))
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => Err(err),
            };
        }
    }

    fn do_write(&mut self, buf: &ByteBuf) -> io::Result<WriteOutcome> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        loop {
            let written = buf
                .readable(|bytes| stream.write(bytes))
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
            return match written {
                Ok(0) => Ok(WriteOutcome::WouldBlock),
                Ok(n) => {
                    buf.advance_reader(n)
                        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
                    Ok(WriteOutcome::Wrote(n))
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => Err(err),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use longeron_core::config::ChannelOptions;
    use longeron_core::reactor::EventLoopGroup;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn test_connect_read_write_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // a peer that echoes one payload back
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut payload = [0u8; 5];
            stream.read_exact(&mut payload).unwrap();
            stream.write_all(&payload).unwrap();
            payload
        });

        let group = EventLoopGroup::with_name(1, "tcp-test").unwrap();
        let channel = crate::tcp_channel(&ChannelOptions::default());
        group.register(&channel).sync().unwrap();
        channel.connect(addr).sync().unwrap();
        assert!(channel.is_active());
        assert!(channel.peer_addr().is_some());

        use longeron_core::alloc::{BufAllocator, UnpooledAllocator};
        use longeron_core::message::Message;
        let buf = UnpooledAllocator.heap_buffer(8);
        buf.write_slice(b"hello").unwrap();
        channel.write_and_flush(Message::from(buf)).sync().unwrap();

        assert_eq!(&server.join().unwrap(), b"hello");

        channel.close().sync().unwrap();
        assert!(!channel.is_open());

        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
            .await_timeout(Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn test_connect_refused() {
        // bind a listener to learn a free port, then close it
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let group = EventLoopGroup::with_name(1, "tcp-refused").unwrap();
        let channel = crate::tcp_channel(&ChannelOptions::default());
        group.register(&channel).sync().unwrap();

        let err = channel.connect(addr).sync().unwrap_err();
        assert!(matches!(
            err,
            longeron_core::error::LongeronError::ConnectRefused(_)
                | longeron_core::error::LongeronError::Io(_)
        ));
        assert!(!channel.is_open());

        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
            .await_timeout(Duration::from_secs(5))
            .unwrap();
    }
}
