//! Buffer allocators.
//!
//! The allocator decides where a [`ByteBuf`]'s region comes from and where
//! it goes when the refcount hits zero. Two policies ship:
//!
//! - [`UnpooledAllocator`]: every buffer is a fresh region, dropped on
//!   release.
//! - [`PooledAllocator`]: regions are recycled through bounded per-size
//!   free lists, separately for the direct (IO-preferred) and heap sides.
//!
//! The pooled/unpooled and direct/heap choices are policies; a buffer's
//! observable contract is identical across all of them.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{ByteBuf, Recycle, MAX_BUFFER_CAPACITY};
use crate::error::Result;

/// Region size classes for the pooled allocator.
const SIZE_CLASSES: [usize; 4] = [4 * 1024, 16 * 1024, 64 * 1024, 256 * 1024];

/// Regions cached per size class per side before recycling falls back to
/// dropping.
const MAX_CACHED_PER_CLASS: usize = 64;

/// Capacity of the per-thread direct scratch buffer used by
/// [`to_direct`] when the allocator does not pool direct regions.
const SCRATCH_CAPACITY: usize = 64 * 1024;

/// Allocation policy for channel buffers.
pub trait BufAllocator: Send + Sync {
    /// Allocate a heap buffer with at least `cap` bytes of capacity.
    fn heap_buffer(&self, cap: usize) -> ByteBuf;

    /// Allocate a direct (IO-preferred) buffer with at least `cap` bytes.
    fn direct_buffer(&self, cap: usize) -> ByteBuf;

    /// Whether direct regions are pooled. Drives the copy policy in
    /// [`to_direct`].
    fn is_direct_pooled(&self) -> bool;

    /// Buffer for socket IO: direct when the allocator pools direct
    /// regions, heap otherwise.
    fn io_buffer(&self, cap: usize) -> ByteBuf {
        if self.is_direct_pooled() {
            self.direct_buffer(cap)
        } else {
            self.heap_buffer(cap)
        }
    }
}

/// Allocator with no recycling. Release drops the region.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnpooledAllocator;

impl BufAllocator for UnpooledAllocator {
    fn heap_buffer(&self, cap: usize) -> ByteBuf {
        ByteBuf::new(vec![0; cap], false, MAX_BUFFER_CAPACITY, None)
    }

    fn direct_buffer(&self, cap: usize) -> ByteBuf {
        ByteBuf::new(vec![0; cap], true, MAX_BUFFER_CAPACITY, None)
    }

    fn is_direct_pooled(&self) -> bool {
        false
    }
}

struct PoolSide {
    classes: [Mutex<Vec<Vec<u8>>>; SIZE_CLASSES.len()],
}

impl PoolSide {
    fn new() -> Self {
        Self {
            classes: Default::default(),
        }
    }

    fn class_for(cap: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&c| cap <= c)
    }

    fn take(&self, cap: usize) -> Option<Vec<u8>> {
        let idx = Self::class_for(cap)?;
        let region = self.classes[idx].lock().pop()?;
        Some(region)
    }

    fn put(&self, region: Vec<u8>) {
        if let Some(idx) = SIZE_CLASSES.iter().position(|&c| region.len() == c) {
            let mut cached = self.classes[idx].lock();
            if cached.len() < MAX_CACHED_PER_CLASS {
                cached.push(region);
            }
        }
        // off-class regions (grown or oversized) are dropped
    }
}

struct PoolShared {
    direct: PoolSide,
    heap: PoolSide,
}

impl Recycle for PoolShared {
    fn recycle(&self, mut region: Vec<u8>, direct: bool) {
        region.iter_mut().for_each(|b| *b = 0);
        if direct {
            self.direct.put(region);
        } else {
            self.heap.put(region);
        }
    }
}

/// Allocator that recycles released regions through per-size free lists.
#[derive(Clone)]
pub struct PooledAllocator {
    shared: Arc<PoolShared>,
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PooledAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                direct: PoolSide::new(),
                heap: PoolSide::new(),
            }),
        }
    }

    fn allocate(&self, cap: usize, direct: bool) -> ByteBuf {
        let side = if direct {
            &self.shared.direct
        } else {
            &self.shared.heap
        };
        let region = match side.take(cap) {
            Some(region) => region,
            None => match PoolSide::class_for(cap) {
                Some(idx) => vec![0; SIZE_CLASSES[idx]],
                // oversized: allocate exact, never recycled back
                None => vec![0; cap],
            },
        };
        ByteBuf::new(
            region,
            direct,
            MAX_BUFFER_CAPACITY,
            Some(self.shared.clone() as Arc<dyn Recycle>),
        )
    }

    #[cfg(test)]
    fn cached_direct(&self, class: usize) -> usize {
        self.shared.direct.classes[class].lock().len()
    }
}

impl BufAllocator for PooledAllocator {
    fn heap_buffer(&self, cap: usize) -> ByteBuf {
        self.allocate(cap, false)
    }

    fn direct_buffer(&self, cap: usize) -> ByteBuf {
        self.allocate(cap, true)
    }

    fn is_direct_pooled(&self) -> bool {
        true
    }
}

thread_local! {
    /// Reusable direct scratch buffer, one per thread. The thread-local
    /// slot keeps one reference; borrowers see the same region each time.
    static DIRECT_SCRATCH: RefCell<Option<ByteBuf>> = const { RefCell::new(None) };
}

fn thread_local_scratch(len: usize) -> Option<ByteBuf> {
    if len > SCRATCH_CAPACITY {
        return None;
    }
    DIRECT_SCRATCH.with(|slot| {
        let mut slot = slot.borrow_mut();
        let buf = slot.get_or_insert_with(|| {
            ByteBuf::new(vec![0; SCRATCH_CAPACITY], true, SCRATCH_CAPACITY, None)
        });
        // in use elsewhere on this thread: refuse rather than alias
        if buf.ref_cnt() != 1 {
            return None;
        }
        buf.clear();
        buf.retain().ok()?;
        Some(buf.clone())
    })
}

/// Convert `src` into a direct buffer holding its readable slice,
/// releasing `src` on success.
///
/// Policy, in order: copy into a pooled direct buffer when the allocator
/// pools them; otherwise stage through the per-thread direct scratch
/// buffer when the slice fits; otherwise hand `src` back unchanged (the
/// copy would cost more than it saves).
pub fn to_direct(alloc: &dyn BufAllocator, src: ByteBuf) -> Result<ByteBuf> {
    if src.is_direct() {
        return Ok(src);
    }
    let readable = src.readable_bytes();
    let dst = if alloc.is_direct_pooled() {
        alloc.direct_buffer(readable)
    } else if let Some(scratch) = thread_local_scratch(readable) {
        scratch
    } else {
        return Ok(src);
    };
    dst.write_slice(&src.to_bytes()?)?;
    src.release()?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpooled_io_buffer_is_heap() {
        let alloc = UnpooledAllocator;
        assert!(!alloc.is_direct_pooled());
        let buf = alloc.io_buffer(1024);
        assert!(!buf.is_direct());
        assert!(buf.capacity() >= 1024);
    }

    #[test]
    fn test_pooled_recycles_region() {
        let alloc = PooledAllocator::new();
        let buf = alloc.direct_buffer(1000);
        assert!(buf.is_direct());
        assert_eq!(buf.capacity(), SIZE_CLASSES[0]);
        assert_eq!(alloc.cached_direct(0), 0);

        buf.release().unwrap();
        assert_eq!(alloc.cached_direct(0), 1);

        // next allocation of the same class reuses the cached region
        let again = alloc.direct_buffer(512);
        assert_eq!(again.capacity(), SIZE_CLASSES[0]);
        assert_eq!(alloc.cached_direct(0), 0);
    }

    #[test]
    fn test_oversized_not_cached() {
        let alloc = PooledAllocator::new();
        let big = alloc.heap_buffer(SIZE_CLASSES[SIZE_CLASSES.len() - 1] + 1);
        let cap = big.capacity();
        big.release().unwrap();
        // an off-class region is dropped, so a fresh one has the same shape
        let again = alloc.heap_buffer(cap);
        assert_eq!(again.capacity(), cap);
    }

    #[test]
    fn test_to_direct_pooled_copies_and_releases() {
        let alloc = PooledAllocator::new();
        let src = alloc.heap_buffer(64);
        src.write_slice(b"payload").unwrap();

        let dst = to_direct(&alloc, src.clone()).unwrap();
        assert!(dst.is_direct());
        assert_eq!(&dst.to_bytes().unwrap()[..], b"payload");
        assert_eq!(src.ref_cnt(), 0);
    }

    #[test]
    fn test_to_direct_unpooled_uses_scratch() {
        let alloc = UnpooledAllocator;
        let src = alloc.heap_buffer(64);
        src.write_slice(b"abc").unwrap();

        let dst = to_direct(&alloc, src).unwrap();
        assert!(dst.is_direct());
        assert_eq!(&dst.to_bytes().unwrap()[..], b"abc");

        // scratch slot retains one count; the borrower holds the other
        assert_eq!(dst.ref_cnt(), 2);
        dst.release().unwrap();
        assert_eq!(dst.ref_cnt(), 1);
    }

    #[test]
    fn test_to_direct_passthrough_when_scratch_busy() {
        let alloc = UnpooledAllocator;

        let first = alloc.heap_buffer(16);
        first.write_slice(b"a").unwrap();
        let held = to_direct(&alloc, first).unwrap();

        // scratch busy: a second conversion must hand the source back
        let second = alloc.heap_buffer(16);
        second.write_slice(b"b").unwrap();
        let back = to_direct(&alloc, second.clone()).unwrap();
        assert!(!back.is_direct());
        assert_eq!(back.ref_cnt(), 1);

        held.release().unwrap();
    }
}
