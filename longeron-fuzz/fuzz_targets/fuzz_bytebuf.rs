//! Fuzz the buffer refcount and cursor discipline.
//!
//! Drives arbitrary op sequences against a `ByteBuf` while mirroring
//! the reference count in a model. The invariants under test: the count
//! never goes negative, deallocation happens exactly once, and every
//! post-release access fails instead of touching freed state.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use longeron_core::alloc::{BufAllocator, PooledAllocator};
use longeron_core::error::LongeronError;

#[derive(Arbitrary, Debug)]
enum Op {
    Retain(u8),
    Release(u8),
    Write(Vec<u8>),
    Read(u16),
    Skip(u16),
    Snapshot,
    Clear,
}

fuzz_target!(|ops: Vec<Op>| {
    let alloc = PooledAllocator::new();
    let buf = alloc.heap_buffer(64);
    let mut model_refs: i64 = 1;
    let mut deallocations = 0u32;

    for op in ops {
        match op {
            Op::Retain(k) => {
                let k = i32::from(k.max(1));
                match buf.retain_n(k) {
                    Ok(()) => {
                        assert!(model_refs > 0, "retain succeeded on a dead buffer");
                        model_refs += i64::from(k);
                    }
                    Err(LongeronError::IllegalRefCount { .. }) => {
                        assert!(model_refs <= 0, "retain failed on a live buffer");
                    }
                    Err(other) => panic!("unexpected retain error: {other}"),
                }
            }
            Op::Release(k) => {
                let k = i32::from(k.max(1));
                match buf.release_n(k) {
                    Ok(deallocated) => {
                        assert!(i64::from(k) <= model_refs, "release over-succeeded");
                        model_refs -= i64::from(k);
                        if deallocated {
                            deallocations += 1;
                            assert_eq!(model_refs, 0, "deallocated with references left");
                        }
                    }
                    Err(LongeronError::IllegalRefCount { .. }) => {
                        assert!(i64::from(k) > model_refs, "release failed while in range");
                    }
                    Err(other) => panic!("unexpected release error: {other}"),
                }
            }
            Op::Write(data) => {
                let result = buf.write_slice(&data);
                if model_refs <= 0 {
                    assert!(result.is_err(), "write succeeded after release");
                }
            }
            Op::Read(n) => {
                let n = usize::from(n) % (buf.readable_bytes() + 1);
                let result = buf.read_bytes(n);
                if model_refs <= 0 && n > 0 {
                    assert!(result.is_err(), "read succeeded after release");
                }
            }
            Op::Skip(n) => {
                let n = usize::from(n) % (buf.readable_bytes() + 1);
                let _ = buf.skip_bytes(n);
            }
            Op::Snapshot => {
                let result = buf.to_bytes();
                assert_eq!(result.is_err(), model_refs <= 0);
            }
            Op::Clear => buf.clear(),
        }
        assert!(buf.ref_cnt() >= 0, "reference count went negative");
        assert!(deallocations <= 1, "double free");
    }
});
