//! The outbound write buffer.
//!
//! Every channel queues `(message, promise)` entries here until `flush`
//! marks a prefix flushable and the socket drain consumes it. Promises
//! complete strictly in submission order. Pending-byte accounting drives
//! the writability watermarks: crossing the high mark turns the channel
//! unwritable, draining below the low mark turns it writable again.
//!
//! The buffer itself is not synchronized; it lives inside the channel's
//! reactor-affine state and is only touched by the owning loop.

use std::collections::VecDeque;

use crate::buffer::ByteBuf;
use crate::error::LongeronError;
use crate::future::Promise;
use crate::message::Message;

pub(crate) struct Entry {
    pub msg: Message,
    /// Bytes still unwritten, for accounting. Starts at the message size.
    pub remaining: usize,
    pub promise: Promise<()>,
}

/// What the socket drain should do with the head entry.
pub(crate) enum HeadEntry {
    /// Write this buffer's readable bytes.
    Buf(ByteBuf),
    /// The entry is not raw bytes; no encoder turned it into any.
    Unsupported,
}

#[derive(Default)]
pub(crate) struct OutboundBuffer {
    entries: VecDeque<Entry>,
    /// Entries `[0, flushed)` are flushable; the rest wait for the next
    /// `add_flush`.
    flushed: usize,
    pending_bytes: usize,
    unwritable: bool,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn is_writable(&self) -> bool {
        !self.unwritable
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_flushed(&self) -> bool {
        self.flushed > 0
    }

    /// Append a message. Returns `true` when this push crossed the high
    /// watermark (the caller fires `channel_writability_changed`).
    pub fn add_message(
        &mut self,
        msg: Message,
        size: usize,
        promise: Promise<()>,
        high_water_mark: usize,
    ) -> bool {
        self.entries.push_back(Entry {
            msg,
            remaining: size,
            promise,
        });
        self.pending_bytes += size;
        if !self.unwritable && self.pending_bytes > high_water_mark {
            self.unwritable = true;
            return true;
        }
        false
    }

    /// Mark everything queued so far as flushable.
    pub fn add_flush(&mut self) {
        self.flushed = self.entries.len();
    }

    /// The first flushable entry, by kind.
    pub fn head(&self) -> Option<HeadEntry> {
        if self.flushed == 0 {
            return None;
        }
        self.entries.front().map(|entry| match &entry.msg {
            Message::Buf(buf) => HeadEntry::Buf(buf.clone()),
            Message::User(_) => HeadEntry::Unsupported,
        })
    }

    /// Record `n` bytes written from the head entry. Returns `true` when
    /// this drain crossed back below the low watermark.
    pub fn progress(&mut self, n: usize, low_water_mark: usize) -> bool {
        if let Some(entry) = self.entries.front_mut() {
            entry.remaining = entry.remaining.saturating_sub(n);
        }
        self.pending_bytes = self.pending_bytes.saturating_sub(n);
        self.check_restored(low_water_mark)
    }

    /// Pop the fully-written head entry. The caller completes the
    /// returned promise (and releases the message) outside the channel
    /// lock. The `bool` reports a low-watermark crossing.
    pub fn remove_complete(&mut self, low_water_mark: usize) -> Option<(Entry, bool)> {
        if self.flushed == 0 {
            return None;
        }
        let entry = self.entries.pop_front()?;
        self.flushed -= 1;
        self.pending_bytes = self.pending_bytes.saturating_sub(entry.remaining);
        let restored = self.check_restored(low_water_mark);
        Some((entry, restored))
    }

    /// Drain every entry, flushed or not. The caller fails each promise
    /// with `cause` and releases the messages outside the lock.
    pub fn drain_all(&mut self) -> Vec<Entry> {
        self.flushed = 0;
        self.pending_bytes = 0;
        self.unwritable = false;
        self.entries.drain(..).collect()
    }

    fn check_restored(&mut self, low_water_mark: usize) -> bool {
        if self.unwritable && self.pending_bytes < low_water_mark {
            self.unwritable = false;
            return true;
        }
        false
    }
}

/// Fail and release a batch of drained entries. Shared by the close path
/// and the unsupported-message path.
pub(crate) fn fail_entries(entries: Vec<Entry>, cause: &LongeronError) {
    for entry in entries {
        if let Err(err) = entry.msg.release() {
            tracing::debug!(%err, "pending write already released");
        }
        entry.promise.try_failure(cause.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{BufAllocator, UnpooledAllocator};

    fn buf_msg(len: usize) -> Message {
        let buf = UnpooledAllocator.heap_buffer(len);
        buf.write_slice(&vec![0xAB; len]).unwrap();
        Message::from(buf)
    }

    #[test]
    fn test_watermark_crossings_fire_once() {
        let mut ob = OutboundBuffer::new();
        let high = 64 * 1024;
        let low = 32 * 1024;

        // 70 KiB in 7 pushes: only the crossing push reports a change
        let mut changes = 0;
        for _ in 0..7 {
            if ob.add_message(buf_msg(10 * 1024), 10 * 1024, Promise::new(), high) {
                changes += 1;
            }
        }
        assert_eq!(changes, 1);
        assert!(!ob.is_writable());

        ob.add_flush();
        // drain down; the restore fires exactly once, below the low mark
        let mut restored = 0;
        while let Some((entry, was_restored)) = ob.remove_complete(low) {
            entry.promise.try_success(());
            if was_restored {
                restored += 1;
                assert!(ob.pending_bytes() < low);
            }
        }
        assert_eq!(restored, 1);
        assert!(ob.is_writable());
    }

    #[test]
    fn test_flush_boundary_and_order() {
        let mut ob = OutboundBuffer::new();
        let p1: Promise<()> = Promise::new();
        let p2: Promise<()> = Promise::new();
        ob.add_message(buf_msg(4), 4, p1.clone(), usize::MAX);
        ob.add_flush();
        ob.add_message(buf_msg(4), 4, p2.clone(), usize::MAX);

        // only the pre-flush entry is drainable
        let (first, _) = ob.remove_complete(0).unwrap();
        first.promise.try_success(());
        assert!(ob.remove_complete(0).is_none());
        assert!(p1.future().is_success());
        assert!(!p2.future().is_done());

        ob.add_flush();
        assert!(ob.has_flushed());
    }

    #[test]
    fn test_partial_progress_accounting() {
        let mut ob = OutboundBuffer::new();
        ob.add_message(buf_msg(100), 100, Promise::new(), usize::MAX);
        ob.add_flush();
        assert_eq!(ob.pending_bytes(), 100);

        ob.progress(60, 0);
        assert_eq!(ob.pending_bytes(), 40);

        let (entry, _) = ob.remove_complete(0).unwrap();
        assert_eq!(entry.remaining, 40);
        assert_eq!(ob.pending_bytes(), 0);
    }

    #[test]
    fn test_drain_all_fails_everything() {
        let mut ob = OutboundBuffer::new();
        let promises: Vec<Promise<()>> = (0..3).map(|_| Promise::new()).collect();
        for promise in &promises {
            ob.add_message(buf_msg(8), 8, promise.clone(), usize::MAX);
        }
        ob.add_flush();

        fail_entries(ob.drain_all(), &LongeronError::ClosedChannel);
        assert!(ob.is_empty());
        assert_eq!(ob.pending_bytes(), 0);
        for promise in &promises {
            assert!(matches!(
                promise.future().cause(),
                Some(LongeronError::ClosedChannel)
            ));
        }
    }
}
