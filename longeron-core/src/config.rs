//! Per-channel configuration.
//!
//! A [`ChannelConfig`] is the live, mutable option bag attached to one
//! channel; [`ChannelOptions`] is the builder used to seed it before the
//! channel exists (the bootstrap path). Receive-buffer sizing is a
//! pluggable policy behind [`RecvBufAllocator`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::alloc::{BufAllocator, PooledAllocator};
use crate::buffer::ByteBuf;

/// Default connect-phase deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default outbound watermarks, in bytes.
pub const DEFAULT_WRITE_BUFFER_HIGH_WATER_MARK: usize = 64 * 1024;
pub const DEFAULT_WRITE_BUFFER_LOW_WATER_MARK: usize = 32 * 1024;

/// Default receive-buffer guess.
const DEFAULT_RECV_BUFFER_SIZE: usize = 8192;

/// Messages read per readiness batch before yielding back to the loop.
const DEFAULT_MAX_MESSAGES_PER_READ: usize = 16;

/// Receive-buffer sizing policy. One handle exists per channel and lives
/// for the channel's lifetime; `reset` is called before each readiness
/// batch.
pub trait RecvBufAllocator: Send + Sync {
    fn new_handle(&self) -> Box<dyn RecvBufHandle>;
}

/// The per-channel side of a [`RecvBufAllocator`].
pub trait RecvBufHandle: Send {
    /// Start a new readiness batch.
    fn reset(&mut self);

    /// Size for the next read buffer.
    fn guess(&self) -> usize;

    /// Record one completed read of `bytes` bytes.
    fn record_read(&mut self, bytes: usize);

    /// Whether the read loop should attempt another read.
    fn continue_reading(&self) -> bool;

    /// The batch finished (before `channel_read_complete` fires).
    fn read_complete(&mut self);

    /// Allocate the next read buffer from `alloc`.
    fn allocate(&self, alloc: &dyn BufAllocator) -> ByteBuf {
        alloc.io_buffer(self.guess())
    }
}

/// Fixed-size receive buffers.
#[derive(Debug, Clone, Copy)]
pub struct FixedRecvBufAllocator {
    size: usize,
    max_messages: usize,
}

impl FixedRecvBufAllocator {
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            max_messages: DEFAULT_MAX_MESSAGES_PER_READ,
        }
    }

    #[must_use]
    pub const fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }
}

impl Default for FixedRecvBufAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_RECV_BUFFER_SIZE)
    }
}

impl RecvBufAllocator for FixedRecvBufAllocator {
    fn new_handle(&self) -> Box<dyn RecvBufHandle> {
        Box::new(FixedHandle {
            size: self.size,
            max_messages: self.max_messages,
            messages: 0,
            last_read: 0,
        })
    }
}

struct FixedHandle {
    size: usize,
    max_messages: usize,
    messages: usize,
    last_read: usize,
}

impl RecvBufHandle for FixedHandle {
    fn reset(&mut self) {
        self.messages = 0;
        self.last_read = 0;
    }

    fn guess(&self) -> usize {
        self.size
    }

    fn record_read(&mut self, bytes: usize) {
        self.messages += 1;
        self.last_read = bytes;
    }

    fn continue_reading(&self) -> bool {
        // a short read means the socket buffer is drained
        self.last_read == self.size && self.messages < self.max_messages
    }

    fn read_complete(&mut self) {}
}

/// Receive buffers that adapt to the observed traffic: double after a
/// full read, halve after two consecutive reads below half the guess.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveRecvBufAllocator {
    min: usize,
    initial: usize,
    max: usize,
    max_messages: usize,
}

impl AdaptiveRecvBufAllocator {
    #[must_use]
    pub fn new(min: usize, initial: usize, max: usize) -> Self {
        debug_assert!(min <= initial && initial <= max);
        Self {
            min,
            initial,
            max,
            max_messages: DEFAULT_MAX_MESSAGES_PER_READ,
        }
    }
}

impl Default for AdaptiveRecvBufAllocator {
    fn default() -> Self {
        Self::new(64, DEFAULT_RECV_BUFFER_SIZE, 64 * 1024)
    }
}

impl RecvBufAllocator for AdaptiveRecvBufAllocator {
    fn new_handle(&self) -> Box<dyn RecvBufHandle> {
        Box::new(AdaptiveHandle {
            min: self.min,
            max: self.max,
            max_messages: self.max_messages,
            guess: self.initial,
            messages: 0,
            last_read: 0,
            small_reads: 0,
        })
    }
}

struct AdaptiveHandle {
    min: usize,
    max: usize,
    max_messages: usize,
    guess: usize,
    messages: usize,
    last_read: usize,
    small_reads: u8,
}

impl RecvBufHandle for AdaptiveHandle {
    fn reset(&mut self) {
        self.messages = 0;
        self.last_read = 0;
    }

    fn guess(&self) -> usize {
        self.guess
    }

    fn record_read(&mut self, bytes: usize) {
        self.messages += 1;
        self.last_read = bytes;
        if bytes == self.guess {
            self.guess = (self.guess * 2).min(self.max);
            self.small_reads = 0;
        } else if bytes < self.guess / 2 {
            self.small_reads += 1;
            if self.small_reads >= 2 {
                self.guess = (self.guess / 2).max(self.min);
                self.small_reads = 0;
            }
        } else {
            self.small_reads = 0;
        }
    }

    fn continue_reading(&self) -> bool {
        self.last_read > 0 && self.messages < self.max_messages
    }

    fn read_complete(&mut self) {}
}

/// Live option bag for one channel. Setters may be called from any
/// thread; the owning reactor observes them on its next pass.
pub struct ChannelConfig {
    connect_timeout_millis: AtomicU64,
    auto_read: AtomicBool,
    high_water_mark: AtomicUsize,
    low_water_mark: AtomicUsize,
    allocator: Mutex<Arc<dyn BufAllocator>>,
    recv_buf_allocator: Mutex<Arc<dyn RecvBufAllocator>>,
}

impl ChannelConfig {
    pub(crate) fn from_options(options: &ChannelOptions) -> Self {
        Self {
            connect_timeout_millis: AtomicU64::new(options.connect_timeout.as_millis() as u64),
            auto_read: AtomicBool::new(options.auto_read),
            high_water_mark: AtomicUsize::new(options.write_buffer_high_water_mark),
            low_water_mark: AtomicUsize::new(options.write_buffer_low_water_mark),
            allocator: Mutex::new(
                options
                    .allocator
                    .clone()
                    .unwrap_or_else(|| Arc::new(PooledAllocator::new())),
            ),
            recv_buf_allocator: Mutex::new(
                options
                    .recv_buf_allocator
                    .clone()
                    .unwrap_or_else(|| Arc::new(FixedRecvBufAllocator::default())),
            ),
        }
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis.load(Ordering::Relaxed))
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.connect_timeout_millis
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_auto_read(&self) -> bool {
        self.auto_read.load(Ordering::Relaxed)
    }

    pub fn set_auto_read(&self, auto_read: bool) {
        self.auto_read.store(auto_read, Ordering::Relaxed);
    }

    #[must_use]
    pub fn write_buffer_high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn write_buffer_low_water_mark(&self) -> usize {
        self.low_water_mark.load(Ordering::Relaxed)
    }

    /// Set both watermarks. `low` must not exceed `high`.
    pub fn set_write_buffer_water_marks(&self, low: usize, high: usize) {
        debug_assert!(low <= high);
        self.low_water_mark.store(low, Ordering::Relaxed);
        self.high_water_mark.store(high, Ordering::Relaxed);
    }

    #[must_use]
    pub fn allocator(&self) -> Arc<dyn BufAllocator> {
        self.allocator.lock().clone()
    }

    pub fn set_allocator(&self, allocator: Arc<dyn BufAllocator>) {
        *self.allocator.lock() = allocator;
    }

    #[must_use]
    pub fn recv_buf_allocator(&self) -> Arc<dyn RecvBufAllocator> {
        self.recv_buf_allocator.lock().clone()
    }

    pub fn set_recv_buf_allocator(&self, allocator: Arc<dyn RecvBufAllocator>) {
        *self.recv_buf_allocator.lock() = allocator;
    }
}

/// Builder for the recognized channel options.
///
/// # Examples
///
/// ```
/// use longeron_core::config::ChannelOptions;
/// use std::time::Duration;
///
/// let opts = ChannelOptions::default()
///     .with_connect_timeout(Duration::from_secs(5))
///     .with_write_buffer_water_marks(16 * 1024, 32 * 1024);
/// ```
#[derive(Clone)]
pub struct ChannelOptions {
    /// Connect-phase deadline (CONNECT_TIMEOUT_MILLIS).
    pub connect_timeout: Duration,

    /// Whether a finished read batch automatically issues the next read.
    pub auto_read: bool,

    /// Pending outbound bytes above which `is_writable` turns false.
    pub write_buffer_high_water_mark: usize,

    /// Pending outbound bytes below which `is_writable` turns true again.
    pub write_buffer_low_water_mark: usize,

    /// Buffer allocator; pooled by default.
    pub allocator: Option<Arc<dyn BufAllocator>>,

    /// Receive-buffer sizing policy; fixed 8 KiB by default.
    pub recv_buf_allocator: Option<Arc<dyn RecvBufAllocator>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_read: true,
            write_buffer_high_water_mark: DEFAULT_WRITE_BUFFER_HIGH_WATER_MARK,
            write_buffer_low_water_mark: DEFAULT_WRITE_BUFFER_LOW_WATER_MARK,
            allocator: None,
            recv_buf_allocator: None,
        }
    }
}

impl ChannelOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_auto_read(mut self, auto_read: bool) -> Self {
        self.auto_read = auto_read;
        self
    }

    /// Set both outbound watermarks.
    ///
    /// # Panics
    ///
    /// Panics if `low > high`.
    #[must_use]
    pub fn with_write_buffer_water_marks(mut self, low: usize, high: usize) -> Self {
        assert!(low <= high, "low watermark above high watermark");
        self.write_buffer_low_water_mark = low;
        self.write_buffer_high_water_mark = high;
        self
    }

    #[must_use]
    pub fn with_allocator(mut self, allocator: Arc<dyn BufAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    #[must_use]
    pub fn with_recv_buf_allocator(mut self, allocator: Arc<dyn RecvBufAllocator>) -> Self {
        self.recv_buf_allocator = Some(allocator);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::from_options(&ChannelOptions::default());
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert!(config.is_auto_read());
        assert_eq!(config.write_buffer_high_water_mark(), 64 * 1024);
        assert_eq!(config.write_buffer_low_water_mark(), 32 * 1024);
    }

    #[test]
    fn test_fixed_handle_batching() {
        let mut handle = FixedRecvBufAllocator::new(1024)
            .with_max_messages(2)
            .new_handle();
        handle.reset();
        assert_eq!(handle.guess(), 1024);

        handle.record_read(1024);
        assert!(handle.continue_reading());
        handle.record_read(1024);
        // message cap reached
        assert!(!handle.continue_reading());

        handle.reset();
        handle.record_read(100);
        // short read ends the batch
        assert!(!handle.continue_reading());
    }

    #[test]
    fn test_adaptive_handle_grows_and_shrinks() {
        let mut handle = AdaptiveRecvBufAllocator::new(64, 1024, 4096).new_handle();
        handle.reset();

        handle.record_read(1024);
        assert_eq!(handle.guess(), 2048);
        handle.record_read(2048);
        assert_eq!(handle.guess(), 4096);
        // capped at max
        handle.record_read(4096);
        assert_eq!(handle.guess(), 4096);

        // two consecutive small reads halve the guess
        handle.record_read(10);
        assert_eq!(handle.guess(), 4096);
        handle.record_read(10);
        assert_eq!(handle.guess(), 2048);
    }
}
