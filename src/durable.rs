//! Publication hook for persistent-memory deployments.
//!
//! The concurrent trie calls [`DurablePublish::persist_node`] on every node it
//! builds before the node becomes reachable, and [`DurablePublish::publish`]
//! after every store into a child slot or the root.

use std::sync::atomic::AtomicU64;

pub trait DurablePublish: Send + Sync {
    /// `len` bytes at `start` hold a node no other thread can see yet.
    fn persist_node(&self, start: *const u8, len: usize);

    /// `slot` was just overwritten.
    fn publish(&self, slot: &AtomicU64);
}

/// Plain DRAM: nothing to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct Volatile;

impl DurablePublish for Volatile {
    #[inline(always)]
    fn persist_node(&self, _start: *const u8, _len: usize) {}

    #[inline(always)]
    fn publish(&self, _slot: &AtomicU64) {}
}

/// Writes back every touched cache line, then fences (x86-64 `clflush` + `mfence`).
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheLineFlush;

#[cfg(target_arch = "x86_64")]
impl CacheLineFlush {
    const LINE: usize = 64;

    fn flush_range(start: *const u8, len: usize) {
        use std::arch::x86_64::{_mm_clflush, _mm_mfence};

        let end = start as usize + len;
        let mut line = start as usize & !(Self::LINE - 1);
        while line < end {
            // SAFETY: every flushed line overlaps a live allocation handed in
            // by the trie; clflush only writes the line back.
            unsafe { _mm_clflush(line as *const u8) };
            line += Self::LINE;
        }
        // SAFETY: SSE2 is part of the x86-64 baseline.
        unsafe { _mm_mfence() };
    }
}

#[cfg(target_arch = "x86_64")]
impl DurablePublish for CacheLineFlush {
    fn persist_node(&self, start: *const u8, len: usize) {
        Self::flush_range(start, len);
    }

    fn publish(&self, slot: &AtomicU64) {
        Self::flush_range(slot.as_ptr() as *const u8, std::mem::size_of::<AtomicU64>());
    }
}
