//! Reference-counted byte buffers.
//!
//! A [`ByteBuf`] is a mutable byte region with independent read and write
//! cursors and an atomic reference count:
//!
//! - `reader_index <= writer_index <= capacity`
//! - the count starts at 1 on allocation
//! - `retain`/`release` adjust it atomically; the release that drives it to
//!   zero returns the backing region to its allocator exactly once
//! - any data access after release fails with `BufferReleased`
//!
//! Handles are cheap clones of a shared region; cloning does NOT retain.
//! Whoever passes a buffer across an ownership boundary and keeps using it
//! must `retain` first.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{LongeronError, Result};

/// Hard ceiling for buffer growth. Requests beyond this fail with
/// `BufferTooLarge` rather than attempting the allocation.
pub const MAX_BUFFER_CAPACITY: usize = 1 << 30;

/// Recycler invoked when a buffer's refcount reaches zero.
///
/// Pooled allocators take the region back into a free list; unpooled
/// buffers simply drop it.
pub(crate) trait Recycle: Send + Sync {
    fn recycle(&self, region: Vec<u8>, direct: bool);
}

struct BufInner {
    refs: AtomicI32,
    reader: AtomicUsize,
    writer: AtomicUsize,
    max_capacity: usize,
    direct: bool,
    recycle: Option<Arc<dyn Recycle>>,
    /// `None` once deallocated. Cursor and data operations are
    /// channel-affine, so the lock is uncontended in practice.
    data: Mutex<Option<Vec<u8>>>,
}

/// A reference-counted byte buffer.
#[derive(Clone)]
pub struct ByteBuf {
    inner: Arc<BufInner>,
}

impl ByteBuf {
    pub(crate) fn new(
        region: Vec<u8>,
        direct: bool,
        max_capacity: usize,
        recycle: Option<Arc<dyn Recycle>>,
    ) -> Self {
        Self {
            inner: Arc::new(BufInner {
                refs: AtomicI32::new(1),
                reader: AtomicUsize::new(0),
                writer: AtomicUsize::new(0),
                max_capacity,
                direct,
                recycle,
                data: Mutex::new(Some(region)),
            }),
        }
    }

    /// Current reference count. Zero means released.
    #[must_use]
    pub fn ref_cnt(&self) -> i32 {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Whether this buffer came from the direct (IO-preferred) side of its
    /// allocator. A sizing policy, not an observable data contract.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.inner.direct
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.data.lock().as_ref().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.inner.max_capacity
    }

    #[must_use]
    pub fn reader_index(&self) -> usize {
        self.inner.reader.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn writer_index(&self) -> usize {
        self.inner.writer.load(Ordering::Relaxed)
    }

    /// Bytes available for reading: `writer_index - reader_index`.
    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index().saturating_sub(self.reader_index())
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    /// Spare capacity between `writer_index` and `capacity`.
    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.capacity().saturating_sub(self.writer_index())
    }

    /// Increment the reference count by one.
    pub fn retain(&self) -> Result<()> {
        self.retain_n(1)
    }

    /// Increment the reference count by `k` (> 0).
    ///
    /// Fails with `IllegalRefCount` if the buffer is already released or
    /// the count would overflow; the count is left unchanged on failure.
    pub fn retain_n(&self, k: i32) -> Result<()> {
        debug_assert!(k > 0);
        let refs = &self.inner.refs;
        let mut old = refs.load(Ordering::Acquire);
        loop {
            if old <= 0 {
                return Err(LongeronError::IllegalRefCount {
                    count: old,
                    adjustment: k,
                });
            }
            let new = old.checked_add(k).ok_or(LongeronError::IllegalRefCount {
                count: old,
                adjustment: k,
            })?;
            match refs.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(cur) => old = cur,
            }
        }
    }

    /// Decrement the reference count by one; deallocate on zero.
    ///
    /// Returns `true` when this call deallocated the buffer.
    pub fn release(&self) -> Result<bool> {
        self.release_n(1)
    }

    /// Decrement the reference count by `k` (> 0).
    ///
    /// Fails with `IllegalRefCount` if `k` exceeds the current count; the
    /// count is left unchanged on failure, so a double release cannot
    /// double-free.
    pub fn release_n(&self, k: i32) -> Result<bool> {
        debug_assert!(k > 0);
        let refs = &self.inner.refs;
        let mut old = refs.load(Ordering::Acquire);
        loop {
            if old < k {
                return Err(LongeronError::IllegalRefCount {
                    count: old,
                    adjustment: -k,
                });
            }
            match refs.compare_exchange_weak(old, old - k, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if old == k {
                        self.deallocate();
                        return Ok(true);
                    }
                    return Ok(false);
                }
                Err(cur) => old = cur,
            }
        }
    }

    /// Leak-detector breadcrumb. Observable only through trace logging;
    /// otherwise a no-op.
    pub fn touch(&self, hint: &'static str) {
        tracing::trace!(refs = self.ref_cnt(), hint, "buffer touched");
    }

    fn deallocate(&self) {
        // The winning CAS above is the only path here, so the take is
        // exactly-once by construction.
        if let Some(region) = self.inner.data.lock().take() {
            if let Some(recycle) = &self.inner.recycle {
                recycle.recycle(region, self.inner.direct);
            }
        }
    }

    /// Append `src`, growing the buffer if needed.
    pub fn write_slice(&self, src: &[u8]) -> Result<()> {
        self.ensure_writable(src.len())?;
        let mut guard = self.inner.data.lock();
        let region = guard.as_mut().ok_or(LongeronError::BufferReleased)?;
        let w = self.inner.writer.load(Ordering::Relaxed);
        region[w..w + src.len()].copy_from_slice(src);
        self.inner.writer.store(w + src.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Read `n` bytes, advancing the read cursor.
    pub fn read_bytes(&self, n: usize) -> Result<Bytes> {
        if n > self.readable_bytes() {
            return Err(LongeronError::IllegalState("read past writer index"));
        }
        let guard = self.inner.data.lock();
        let region = guard.as_ref().ok_or(LongeronError::BufferReleased)?;
        let r = self.inner.reader.load(Ordering::Relaxed);
        let out = Bytes::copy_from_slice(&region[r..r + n]);
        self.inner.reader.store(r + n, Ordering::Relaxed);
        Ok(out)
    }

    /// Copy of the readable region without advancing the read cursor.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let guard = self.inner.data.lock();
        let region = guard.as_ref().ok_or(LongeronError::BufferReleased)?;
        let r = self.inner.reader.load(Ordering::Relaxed);
        let w = self.inner.writer.load(Ordering::Relaxed);
        Ok(Bytes::copy_from_slice(&region[r..w]))
    }

    /// Advance the read cursor without looking at the bytes.
    pub fn skip_bytes(&self, n: usize) -> Result<()> {
        if n > self.readable_bytes() {
            return Err(LongeronError::IllegalState("skip past writer index"));
        }
        self.inner.reader.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }

    /// Run `f` over the readable region. Pair with [`Self::advance_reader`]
    /// after the consumer reports how much it took.
    pub fn readable<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let guard = self.inner.data.lock();
        let region = guard.as_ref().ok_or(LongeronError::BufferReleased)?;
        let r = self.inner.reader.load(Ordering::Relaxed);
        let w = self.inner.writer.load(Ordering::Relaxed);
        Ok(f(&region[r..w]))
    }

    /// Run `f` over the spare (unwritten) region. Pair with
    /// [`Self::advance_writer`] after the producer reports how much it wrote.
    pub fn unwritten<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut guard = self.inner.data.lock();
        let region = guard.as_mut().ok_or(LongeronError::BufferReleased)?;
        let w = self.inner.writer.load(Ordering::Relaxed);
        Ok(f(&mut region[w..]))
    }

    pub fn advance_reader(&self, n: usize) -> Result<()> {
        self.skip_bytes(n)
    }

    pub fn advance_writer(&self, n: usize) -> Result<()> {
        if n > self.writable_bytes() {
            return Err(LongeronError::IllegalState("advance past capacity"));
        }
        self.inner.writer.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }

    /// Reset both cursors. Contents are left as-is.
    pub fn clear(&self) {
        self.inner.reader.store(0, Ordering::Relaxed);
        self.inner.writer.store(0, Ordering::Relaxed);
    }

    /// Grow until at least `n` bytes are writable.
    ///
    /// Growth doubles the capacity until it fits, bounded by
    /// `max_capacity`; past the bound the request fails with
    /// `BufferTooLarge`.
    pub fn ensure_writable(&self, n: usize) -> Result<()> {
        let mut guard = self.inner.data.lock();
        let region = guard.as_mut().ok_or(LongeronError::BufferReleased)?;
        let w = self.inner.writer.load(Ordering::Relaxed);
        let needed = w + n;
        if needed <= region.len() {
            return Ok(());
        }
        if needed > self.inner.max_capacity {
            return Err(LongeronError::BufferTooLarge {
                requested: needed,
                max: self.inner.max_capacity,
            });
        }
        let mut new_cap = region.len().max(64);
        while new_cap < needed {
            new_cap = (new_cap * 2).min(self.inner.max_capacity);
        }
        region.resize(new_cap, 0);
        Ok(())
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("refs", &self.ref_cnt())
            .field("reader", &self.reader_index())
            .field("writer", &self.writer_index())
            .field("capacity", &self.capacity())
            .field("direct", &self.inner.direct)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    fn heap(cap: usize) -> ByteBuf {
        ByteBuf::new(vec![0; cap], false, MAX_BUFFER_CAPACITY, None)
    }

    #[test]
    fn test_cursor_roundtrip() {
        let buf = heap(16);
        buf.write_slice(b"hello world").unwrap();
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.read_bytes(5).unwrap()[..], b"hello");
        assert_eq!(buf.readable_bytes(), 6);
        assert_eq!(&buf.to_bytes().unwrap()[..], b" world");
        // to_bytes must not consume
        assert_eq!(buf.readable_bytes(), 6);
    }

    #[test]
    fn test_growth_and_too_large() {
        let buf = ByteBuf::new(vec![0; 8], false, 64, None);
        buf.write_slice(&[7u8; 40]).unwrap();
        assert!(buf.capacity() >= 48);

        let err = buf.write_slice(&[7u8; 64]).unwrap_err();
        assert!(matches!(err, LongeronError::BufferTooLarge { .. }));
        // failed growth leaves the cursor untouched
        assert_eq!(buf.readable_bytes(), 40);
    }

    #[test]
    fn test_retain_release_cancel_out() {
        let buf = heap(8);
        buf.retain_n(3).unwrap();
        assert_eq!(buf.ref_cnt(), 4);
        assert!(!buf.release_n(3).unwrap());
        assert_eq!(buf.ref_cnt(), 1);
        buf.write_slice(b"still usable").unwrap();
    }

    #[test]
    fn test_double_release_is_illegal_not_double_free() {
        struct CountingPool(Counter);
        impl Recycle for CountingPool {
            fn recycle(&self, _region: Vec<u8>, _direct: bool) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let pool = Arc::new(CountingPool(Counter::new(0)));
        let buf = ByteBuf::new(vec![0; 8], false, 64, Some(pool.clone()));

        assert!(buf.release().unwrap());
        let err = buf.release().unwrap_err();
        assert!(matches!(
            err,
            LongeronError::IllegalRefCount {
                count: 0,
                adjustment: -1
            }
        ));
        // deallocated exactly once
        assert_eq!(pool.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_access_after_release() {
        let buf = heap(8);
        buf.release().unwrap();
        assert!(matches!(
            buf.write_slice(b"x").unwrap_err(),
            LongeronError::BufferReleased
        ));
        assert!(matches!(
            buf.to_bytes().unwrap_err(),
            LongeronError::BufferReleased
        ));
        assert!(matches!(
            buf.retain().unwrap_err(),
            LongeronError::IllegalRefCount { .. }
        ));
    }

    #[test]
    fn test_unwritten_then_advance() {
        let buf = heap(8);
        let n = buf
            .unwritten(|spare| {
                spare[..3].copy_from_slice(b"abc");
                3
            })
            .unwrap();
        buf.advance_writer(n).unwrap();
        assert_eq!(&buf.to_bytes().unwrap()[..], b"abc");
    }
}
