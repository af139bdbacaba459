//! Group shutdown: the quiet-period protocol and its hard bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use longeron::prelude::*;

#[test]
fn termination_future_completes_within_the_timeout_bound() {
    let group = Arc::new(EventLoopGroup::with_name(3, "shutdown-test").unwrap());

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..30 {
        let counter = ran.clone();
        group.next().execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let quiet = Duration::from_millis(50);
    let timeout = Duration::from_secs(2);
    let started = Instant::now();
    let termination = group.shutdown_gracefully(quiet, timeout);

    // within timeout plus scheduling slack
    assert!(termination.await_timeout(timeout + Duration::from_secs(2)).unwrap());
    assert!(started.elapsed() <= timeout + Duration::from_secs(2));

    // everything submitted before the shutdown drained first
    assert_eq!(ran.load(Ordering::SeqCst), 30);
    assert!(group.termination_future().is_success());
}

#[test]
fn shutdown_closes_registered_channels() {
    let group = Arc::new(EventLoopGroup::with_name(1, "shutdown-close").unwrap());
    let channel = tcp_channel(&ChannelOptions::default());
    group.register(&channel).sync().unwrap();
    assert!(channel.is_registered());

    group
        .shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(2))
        .await_timeout(Duration::from_secs(5))
        .unwrap();

    assert!(!channel.is_open());
    assert!(channel.close_future().await_timeout(Duration::from_secs(1)).unwrap());
}
