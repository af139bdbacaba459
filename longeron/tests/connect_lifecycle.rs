//! End-to-end connect over real TCP through the bootstrap.
//!
//! The initializer installs a recording handler and removes itself; the
//! recorder must observe exactly `handler_added`, `channel_registered`,
//! `channel_active`, each on the channel's own reactor.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use longeron::prelude::*;

#[derive(Clone)]
struct Recorder {
    events: flume::Sender<(String, bool)>,
}

impl Recorder {
    fn record(&self, ctx: &Context, event: &str) {
        let affine = ctx
            .executor()
            .map(|executor| executor.in_event_loop())
            .unwrap_or(false);
        let _ = self.events.send((event.to_string(), affine));
    }
}

impl ChannelHandler for Recorder {
    fn handler_added(&self, ctx: &Context) -> longeron::Result<()> {
        self.record(ctx, "handler_added");
        Ok(())
    }
}

impl InboundHandler for Recorder {
    fn channel_registered(&self, ctx: &Context) -> longeron::Result<()> {
        self.record(ctx, "channel_registered");
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_active(&self, ctx: &Context) -> longeron::Result<()> {
        self.record(ctx, "channel_active");
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &Context) -> longeron::Result<()> {
        self.record(ctx, "channel_inactive");
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &Context) -> longeron::Result<()> {
        self.record(ctx, "channel_unregistered");
        ctx.fire_channel_unregistered();
        Ok(())
    }
}

#[test]
fn connect_success_event_order() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hold = std::thread::spawn(move || listener.accept().map(|(stream, _)| stream));

    let (tx, rx) = flume::unbounded();
    let recorder = Recorder { events: tx };

    let group = Arc::new(EventLoopGroup::with_name(1, "lifecycle-test").unwrap());
    let bootstrap = Bootstrap::new()
        .with_group(group.clone())
        .with_handler(HandlerBox::inbound(ChannelInitializer::new(
            move |channel: &Channel| {
                channel
                    .pipeline()
                    .add_last(Some("recorder"), HandlerBox::inbound(recorder.clone()))
            },
        )));

    let channel = bootstrap.connect_addr(addr).get().unwrap();
    assert!(channel.is_active());
    // the initializer removed itself
    assert_eq!(channel.pipeline().names(), vec!["recorder"]);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let (event, affine) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(affine, "{event} observed off the channel's reactor");
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec!["handler_added", "channel_registered", "channel_active"]
    );

    channel.close().sync().unwrap();
    let mut tail_events = Vec::new();
    for _ in 0..2 {
        let (event, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        tail_events.push(event);
    }
    assert_eq!(tail_events, vec!["channel_inactive", "channel_unregistered"]);

    drop(hold.join().unwrap());
    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
        .await_timeout(Duration::from_secs(5))
        .unwrap();
}

#[test]
fn bootstrap_fails_on_refused_connect() {
    let port = portpicker::pick_unused_port().expect("a free port");
    let group = Arc::new(EventLoopGroup::with_name(1, "refused-test").unwrap());
    let bootstrap = Bootstrap::new()
        .with_group(group.clone())
        .with_handler(HandlerBox::inbound(ChannelInitializer::new(
            |_channel: &Channel| Ok(()),
        )));

    let err = bootstrap.connect("127.0.0.1", port).sync().unwrap_err();
    assert!(matches!(
        err,
        LongeronError::ConnectRefused(_) | LongeronError::Io(_)
    ));

    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
        .await_timeout(Duration::from_secs(5))
        .unwrap();
}

#[test]
fn bootstrap_fails_on_unresolvable_host() {
    let group = Arc::new(EventLoopGroup::with_name(1, "resolve-test").unwrap());
    let bootstrap = Bootstrap::new()
        .with_group(group.clone())
        .with_handler(HandlerBox::inbound(ChannelInitializer::new(
            |_channel: &Channel| Ok(()),
        )));

    let future = bootstrap.connect("definitely-not-a-host.invalid", 4000);
    let err = future.sync().unwrap_err();
    assert!(matches!(err, LongeronError::UnresolvedAddress(_)));

    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
        .await_timeout(Duration::from_secs(5))
        .unwrap();
}

#[test]
fn handler_events_follow_executor_override() {
    let (tx, rx) = flume::unbounded();
    let recorder = Recorder { events: tx };

    let override_executor = SingleThreadExecutor::new("override-exec").unwrap();
    let embedded = EmbeddedChannel::new(&ChannelOptions::default());
    embedded
        .channel()
        .pipeline()
        .add_last_exec(
            Some("offloaded"),
            HandlerBox::inbound(recorder),
            Some(override_executor.clone()),
        )
        .unwrap();
    embedded.run_pending();

    embedded.connect("192.0.2.9:4000".parse().unwrap());
    embedded.run_pending();

    // handler_added and channel_active hop to the override executor;
    // affinity is observed there
    let mut affine_events = 0;
    while let Ok((event, affine)) = rx.recv_timeout(Duration::from_secs(2)) {
        assert!(affine, "{event} ran off its override executor");
        affine_events += 1;
        if event == "channel_active" {
            break;
        }
    }
    assert!(affine_events >= 2);

    override_executor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
}
