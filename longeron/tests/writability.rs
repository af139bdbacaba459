//! Watermark-driven writability against a stalled peer.
//!
//! Defaults: high = 64 KiB, low = 32 KiB. Queueing 70 KiB against a
//! refusing transport flips `is_writable` to false exactly once;
//! draining below 32 KiB flips it back exactly once.

use std::sync::{Arc, Mutex};

use longeron::prelude::*;

#[derive(Clone)]
struct WritabilityProbe {
    toggles: Arc<Mutex<Vec<bool>>>,
}

impl ChannelHandler for WritabilityProbe {}

impl InboundHandler for WritabilityProbe {
    fn channel_writability_changed(&self, ctx: &Context, writable: bool) -> longeron::Result<()> {
        self.toggles.lock().unwrap().push(writable);
        ctx.fire_channel_writability_changed(writable);
        Ok(())
    }
}

fn payload(len: usize) -> Message {
    let buf = UnpooledAllocator.heap_buffer(len);
    buf.write_slice(&vec![0x42; len]).unwrap();
    Message::from(buf)
}

#[test]
fn watermarks_toggle_writability_once_each_way() {
    let toggles = Arc::new(Mutex::new(Vec::new()));
    let probe = WritabilityProbe {
        toggles: toggles.clone(),
    };

    let embedded = EmbeddedChannel::with_setup(
        &ChannelOptions::default(),
        ConnectBehavior::Immediate,
        |channel| {
            channel
                .pipeline()
                .add_last(Some("probe"), HandlerBox::inbound(probe))
                .unwrap();
        },
    );
    embedded.connect("192.0.2.7:9000".parse().unwrap());
    assert!(embedded.channel().is_writable());

    // stalled peer: nothing drains
    embedded.refuse_writes(true);
    let mut write_futures = Vec::new();
    for _ in 0..7 {
        write_futures.push(embedded.channel().write_and_flush(payload(10 * 1024)));
    }
    embedded.run_pending();

    assert_eq!(embedded.channel().pending_outbound_bytes(), 70 * 1024);
    assert!(!embedded.channel().is_writable());
    assert_eq!(*toggles.lock().unwrap(), vec![false]);

    // peer drains everything: crossing the low mark restores writability
    embedded.refuse_writes(false);
    assert!(embedded.channel().is_writable());
    assert_eq!(embedded.channel().pending_outbound_bytes(), 0);
    assert_eq!(*toggles.lock().unwrap(), vec![false, true]);

    for future in write_futures {
        assert!(future.is_success());
    }
    let written: usize = embedded.written().iter().map(bytes::Bytes::len).sum();
    assert_eq!(written, 70 * 1024);
}
