//! Minimal client: connect, send one line, print whatever comes back.
//!
//! Run an echo peer first, e.g. `ncat -l -k -e /bin/cat 7777`, then:
//!
//! ```sh
//! cargo run --example echo_client -- 127.0.0.1 7777
//! ```

use std::sync::Arc;
use std::time::Duration;

use longeron::prelude::*;

fn main() -> longeron::Result<()> {
    longeron::dev_tracing::init_tracing();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().and_then(|p| p.parse().ok()).unwrap_or(7777);

    let group = Arc::new(EventLoopGroup::new(1)?);

    let bootstrap = Bootstrap::new()
        .with_group(group.clone())
        .with_handler(HandlerBox::inbound(ChannelInitializer::new(
            |channel: &Channel| {
                channel.pipeline().add_last(
                    Some("printer"),
                    HandlerBox::inbound(TypedInboundHandler::<ByteBuf, _>::new(|_ctx, buf| {
                        let bytes = buf.to_bytes()?;
                        println!("<- {}", String::from_utf8_lossy(&bytes));
                        Ok(())
                    })),
                )
            },
        )));

    let channel = bootstrap.connect(&host, port).get()?;
    println!("connected to {host}:{port}");

    let buf = UnpooledAllocator.heap_buffer(64);
    buf.write_slice(b"hello from longeron\n")?;
    channel.write_and_flush(Message::from(buf)).sync()?;

    // give the echo a moment to arrive before tearing down
    std::thread::sleep(Duration::from_millis(500));
    channel.close().sync()?;
    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
        .sync()?;
    Ok(())
}
