//! Close racing a pending flush.
//!
//! A message queued behind a stalled peer must fail with the
//! closed-channel error when `close` wins, and none of its bytes may
//! reach the kernel.

use longeron::prelude::*;

fn payload(text: &[u8]) -> Message {
    let buf = UnpooledAllocator.heap_buffer(text.len());
    buf.write_slice(text).unwrap();
    Message::from(buf)
}

#[test]
fn close_fails_pending_writes_without_emitting_bytes() {
    let embedded =
        EmbeddedChannel::with_connect(&ChannelOptions::default(), ConnectBehavior::Immediate);
    embedded.connect("192.0.2.3:9000".parse().unwrap());

    embedded.refuse_writes(true);
    let write_future = embedded
        .channel()
        .write_and_flush(payload(b"must never hit the wire"));
    embedded.run_pending();
    assert!(!write_future.is_done());

    let close_future = embedded.channel().close();
    embedded.run_pending();

    assert!(close_future.is_success());
    assert!(matches!(
        write_future.cause(),
        Some(LongeronError::ClosedChannel)
    ));
    assert!(embedded.written().is_empty());
    assert!(!embedded.channel().is_open());
}

#[test]
fn write_after_close_fails_immediately() {
    let embedded =
        EmbeddedChannel::with_connect(&ChannelOptions::default(), ConnectBehavior::Immediate);
    embedded.connect("192.0.2.3:9000".parse().unwrap());

    embedded.channel().close();
    embedded.run_pending();

    let future = embedded.channel().write_and_flush(payload(b"late"));
    embedded.run_pending();
    assert!(matches!(future.cause(), Some(LongeronError::ClosedChannel)));
}

#[test]
fn double_close_collapses_to_one_terminal_state() {
    let embedded =
        EmbeddedChannel::with_connect(&ChannelOptions::default(), ConnectBehavior::Immediate);
    embedded.connect("192.0.2.3:9000".parse().unwrap());

    let first = embedded.channel().close();
    let second = embedded.channel().close();
    embedded.run_pending();
    let third = embedded.channel().close();
    embedded.run_pending();

    assert!(first.is_success());
    assert!(second.is_success());
    assert!(third.is_success());
}
