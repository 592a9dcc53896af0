// =============================================================================
// Compound nodes
// =============================================================================
//
// Every node is one heap allocation:
//
// [NodeHeader][partial keys: width * len, padded to 8][children: AtomicU64 * len]
//
// Nodes are immutable after publication except for their child slots, their
// height (single-threaded deletes only) and their sync word. Structural changes
// build a replacement node and swap the pointer in the parent slot.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use crate::child::ChildPointer;
use crate::mapping::PartialKeyMapping;

pub(crate) const MAX_ENTRIES: usize = 32;

/// Node layout: mapping representation x partial-key width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum NodeKind {
    SingleMask8,
    SingleMask16,
    SingleMask32,
    MultiMask8x8,
    MultiMask8x16,
    MultiMask8x32,
    MultiMask16x16,
    MultiMask32x32,
}

impl NodeKind {
    pub const ALL: [NodeKind; 8] = [
        NodeKind::SingleMask8,
        NodeKind::SingleMask16,
        NodeKind::SingleMask32,
        NodeKind::MultiMask8x8,
        NodeKind::MultiMask8x16,
        NodeKind::MultiMask8x32,
        NodeKind::MultiMask16x16,
        NodeKind::MultiMask32x32,
    ];

    pub(crate) fn for_mapping(mapping: PartialKeyMapping) -> Self {
        let bits = mapping.num_bits();
        match mapping {
            PartialKeyMapping::Single(_) if bits <= 8 => NodeKind::SingleMask8,
            PartialKeyMapping::Single(_) if bits <= 16 => NodeKind::SingleMask16,
            PartialKeyMapping::Single(_) => NodeKind::SingleMask32,
            PartialKeyMapping::Multi1(_) if bits <= 8 => NodeKind::MultiMask8x8,
            PartialKeyMapping::Multi1(_) if bits <= 16 => NodeKind::MultiMask8x16,
            PartialKeyMapping::Multi1(_) => NodeKind::MultiMask8x32,
            PartialKeyMapping::Multi2(_) => NodeKind::MultiMask16x16,
            PartialKeyMapping::Multi4(_) => NodeKind::MultiMask32x32,
        }
    }

    /// Bytes per stored partial key.
    #[inline]
    pub fn partial_key_width(self) -> usize {
        match self {
            NodeKind::SingleMask8 | NodeKind::MultiMask8x8 => 1,
            NodeKind::SingleMask16 | NodeKind::MultiMask8x16 | NodeKind::MultiMask16x16 => 2,
            NodeKind::SingleMask32 | NodeKind::MultiMask8x32 | NodeKind::MultiMask32x32 => 4,
        }
    }

    /// Name used in statistics reports.
    pub fn name(self) -> &'static str {
        match self {
            NodeKind::SingleMask8 => "SINGLE_MASK_8_BIT_PARTIAL_KEYS",
            NodeKind::SingleMask16 => "SINGLE_MASK_16_BIT_PARTIAL_KEYS",
            NodeKind::SingleMask32 => "SINGLE_MASK_32_BIT_PARTIAL_KEYS",
            NodeKind::MultiMask8x8 => "MULTI_MASK_8_BYTES_AND_8_BIT_PARTIAL_KEYS",
            NodeKind::MultiMask8x16 => "MULTI_MASK_8_BYTES_AND_16_BIT_PARTIAL_KEYS",
            NodeKind::MultiMask8x32 => "MULTI_MASK_8_BYTES_AND_32_BIT_PARTIAL_KEYS",
            NodeKind::MultiMask16x16 => "MULTI_MASK_16_BYTES_AND_16_BIT_PARTIAL_KEYS",
            NodeKind::MultiMask32x32 => "MULTI_MASK_32_BYTES_AND_32_BIT_PARTIAL_KEYS",
        }
    }
}

// =============================================================================
// Sync word
// =============================================================================
//
// bit 0: obsolete, bit 1: locked, bits 2..: version (bumped on every unlock).

const OBSOLETE: u64 = 0b01;
const LOCKED: u64 = 0b10;
const VERSION_STEP: u64 = 0b100;

#[repr(C)]
pub(crate) struct NodeHeader {
    sync: AtomicU64,
    height: AtomicU16,
    len: u8,
    kind: NodeKind,
    mapping: PartialKeyMapping,
}

const HEADER_SIZE: usize = size_of::<NodeHeader>();
const NODE_ALIGN: usize = align_of::<NodeHeader>();

const _: () = assert!(HEADER_SIZE % 8 == 0 && NODE_ALIGN >= 8);

#[inline]
const fn keys_size(width: usize, len: usize) -> usize {
    (width * len + 7) & !7
}

#[inline]
fn node_layout(kind: NodeKind, len: usize) -> Layout {
    let size = HEADER_SIZE + keys_size(kind.partial_key_width(), len) + len * size_of::<AtomicU64>();
    // SAFETY: the alignment is that of `NodeHeader` (a power of two) and the size
    // is a few hundred bytes at most.
    unsafe { Layout::from_size_align_unchecked(size, NODE_ALIGN) }
}

/// Partial keys of a node, at their stored width.
#[derive(Clone, Copy, Debug)]
pub(crate) enum PartialKeys<'a> {
    U8(&'a [u8]),
    U16(&'a [u16]),
    U32(&'a [u32]),
}

impl PartialKeys<'_> {
    #[inline]
    pub(crate) fn get(self, idx: usize) -> u32 {
        match self {
            PartialKeys::U8(k) => u32::from(k[idx]),
            PartialKeys::U16(k) => u32::from(k[idx]),
            PartialKeys::U32(k) => k[idx],
        }
    }
}

/// Pointer to a live node.
///
/// A `NodePtr` is only created by [`NodePtr::allocate`] or by decoding a child
/// pointer read from a live trie. Callers keep the node alive for as long as
/// they use it: single-threaded tries through `&self`/`&mut self` borrows, the
/// concurrent trie through an epoch guard.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodePtr(NonNull<NodeHeader>);

impl std::fmt::Debug for NodePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodePtr({:#x}, {:?}, len={})", self.addr(), self.kind(), self.len())
    }
}

impl NodePtr {
    /// Allocates a node holding `keys` (sparse partial keys, first one zero) and
    /// `children`. Heights are exact: one more than the tallest child.
    pub(crate) fn allocate(mapping: PartialKeyMapping, keys: &[u32], children: &[ChildPointer]) -> NodePtr {
        let len = children.len();
        debug_assert!((2..=MAX_ENTRIES).contains(&len));
        debug_assert_eq!(keys.len(), len);
        debug_assert_eq!(keys[0], 0);

        let kind = NodeKind::for_mapping(mapping);
        let height = 1 + children.iter().map(|c| c.height()).max().unwrap_or(0);
        let layout = node_layout(kind, len);

        // SAFETY: `layout` has non-zero size.
        let raw = unsafe { alloc(layout) } as *mut NodeHeader;
        let Some(header) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };

        // SAFETY: freshly allocated with room for header, keys and children; every
        // region is initialized before the pointer escapes.
        unsafe {
            header.as_ptr().write(NodeHeader {
                sync: AtomicU64::new(0),
                height: AtomicU16::new(height),
                len: len as u8,
                kind,
                mapping,
            });
            let keys_ptr = (raw as *mut u8).add(HEADER_SIZE);
            match kind.partial_key_width() {
                1 => {
                    for (i, &k) in keys.iter().enumerate() {
                        debug_assert!(k <= u32::from(u8::MAX));
                        keys_ptr.add(i).write(k as u8);
                    }
                }
                2 => {
                    let p = keys_ptr as *mut u16;
                    for (i, &k) in keys.iter().enumerate() {
                        debug_assert!(k <= u32::from(u16::MAX));
                        p.add(i).write(k as u16);
                    }
                }
                _ => {
                    let p = keys_ptr as *mut u32;
                    for (i, &k) in keys.iter().enumerate() {
                        p.add(i).write(k);
                    }
                }
            }
            let children_ptr = keys_ptr.add(keys_size(kind.partial_key_width(), len)) as *mut AtomicU64;
            for (i, c) in children.iter().enumerate() {
                children_ptr.add(i).write(AtomicU64::new(c.raw()));
            }
        }

        NodePtr(header)
    }

    /// # Safety
    ///
    /// `addr` must come from [`NodePtr::addr`] of a node that is still allocated.
    #[inline]
    pub(crate) unsafe fn from_addr(addr: usize) -> NodePtr {
        // SAFETY: caller guarantees `addr` is a non-null node address.
        NodePtr(unsafe { NonNull::new_unchecked(addr as *mut NodeHeader) })
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Releases the node's memory (not its children).
    ///
    /// # Safety
    ///
    /// The node must be unreachable and no other thread may still read it.
    pub(crate) unsafe fn free(self) {
        let layout = node_layout(self.kind(), self.len());
        // SAFETY: allocated by `allocate` with this exact layout.
        unsafe { dealloc(self.0.as_ptr() as *mut u8, layout) };
    }

    #[inline]
    fn header(&self) -> &NodeHeader {
        // SAFETY: see the type-level invariant.
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub(crate) fn len(self) -> usize {
        self.header().len as usize
    }

    #[inline]
    pub(crate) fn is_full(self) -> bool {
        self.len() == MAX_ENTRIES
    }

    #[inline]
    pub(crate) fn kind(self) -> NodeKind {
        self.header().kind
    }

    #[inline]
    pub(crate) fn mapping(self) -> PartialKeyMapping {
        self.header().mapping
    }

    #[inline]
    pub(crate) fn most_significant_bit(self) -> u16 {
        self.header().mapping.most_significant_bit()
    }

    #[inline]
    pub(crate) fn height(self) -> u16 {
        self.header().height.load(Ordering::Relaxed)
    }

    /// Rewrites the height of a node that is already linked into a tree.
    ///
    /// # Safety
    ///
    /// No other thread may read the node. Published nodes are otherwise
    /// immutable, so the concurrent trie never calls this; only the
    /// single-threaded delete, which holds `&mut` to its tree, does.
    #[inline]
    pub(crate) unsafe fn set_height(self, height: u16) {
        self.header().height.store(height, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn memory_size(self) -> usize {
        node_layout(self.kind(), self.len()).size()
    }

    /// Start address and size of the node's memory.
    #[inline]
    pub(crate) fn memory(self) -> (*const u8, usize) {
        (self.0.as_ptr() as *const u8, self.memory_size())
    }

    #[inline]
    fn keys_ptr(self) -> *const u8 {
        // SAFETY: the key region directly follows the header.
        unsafe { (self.0.as_ptr() as *const u8).add(HEADER_SIZE) }
    }

    #[inline]
    pub(crate) fn partial_keys(&self) -> PartialKeys<'_> {
        let len = self.len();
        let ptr = self.keys_ptr();
        // SAFETY: `len` keys of the kind's width were written by `allocate` and
        // are never mutated afterwards.
        unsafe {
            match self.kind().partial_key_width() {
                1 => PartialKeys::U8(std::slice::from_raw_parts(ptr, len)),
                2 => PartialKeys::U16(std::slice::from_raw_parts(ptr as *const u16, len)),
                _ => PartialKeys::U32(std::slice::from_raw_parts(ptr as *const u32, len)),
            }
        }
    }

    #[inline]
    pub(crate) fn child_slots(&self) -> &[AtomicU64] {
        let len = self.len();
        // SAFETY: `len` child slots follow the padded key region.
        unsafe {
            let ptr = self.keys_ptr().add(keys_size(self.kind().partial_key_width(), len));
            std::slice::from_raw_parts(ptr as *const AtomicU64, len)
        }
    }

    #[inline]
    pub(crate) fn child(self, idx: usize) -> ChildPointer {
        ChildPointer::from_raw(self.child_slots()[idx].load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn store_child(self, idx: usize, child: ChildPointer) {
        self.child_slots()[idx].store(child.raw(), Ordering::Release);
    }

    /// Index of the entry a key is routed to: the last entry whose sparse
    /// partial key is a subset of the key's dense partial key.
    #[inline]
    pub(crate) fn search_index(self, key: &[u8]) -> usize {
        let dense = self.mapping().extract(key);
        let mask = self.search_mask(dense);
        debug_assert_ne!(mask, 0, "entry 0 always matches");
        (31 - mask.leading_zeros()) as usize
    }

    // =========================================================================
    // Lock / version
    // =========================================================================

    /// Spins while another writer holds the lock; fails once the node is obsolete.
    pub(crate) fn try_lock(self) -> bool {
        let sync = &self.header().sync;
        let backoff = Backoff::new();
        loop {
            let cur = sync.load(Ordering::Acquire);
            if cur & OBSOLETE != 0 {
                return false;
            }
            if cur & LOCKED != 0 {
                backoff.snooze();
                continue;
            }
            if sync
                .compare_exchange_weak(cur, cur | LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            backoff.spin();
        }
    }

    #[inline]
    pub(crate) fn unlock(self) {
        let prev = self.header().sync.fetch_add(VERSION_STEP - LOCKED, Ordering::Release);
        debug_assert!(prev & LOCKED != 0);
    }

    /// Must be called while holding the lock.
    #[inline]
    pub(crate) fn mark_obsolete(self) {
        let prev = self.header().sync.fetch_or(OBSOLETE, Ordering::Release);
        debug_assert!(prev & LOCKED != 0);
    }

    #[cfg(test)]
    pub(crate) fn is_obsolete(self) -> bool {
        self.header().sync.load(Ordering::Acquire) & OBSOLETE != 0
    }

    #[cfg(test)]
    pub(crate) fn version(self) -> u64 {
        self.header().sync.load(Ordering::Acquire) / VERSION_STEP
    }

    // =========================================================================
    // Search mask
    // =========================================================================

    /// Bit `i` set iff entry `i`'s sparse partial key is a subset of `dense`.
    #[inline]
    pub(crate) fn search_mask(self, dense: u32) -> u32 {
        let n = self.len();
        let n_mask = if n == 32 { !0u32 } else { (1u32 << n) - 1 };

        #[cfg(target_arch = "x86_64")]
        {
            if std::is_x86_feature_detected!("avx2") {
                let mask = match self.partial_keys() {
                    PartialKeys::U8(keys) => {
                        let mut buf = [0u8; 32];
                        buf[..n].copy_from_slice(keys);
                        // SAFETY: guarded by `is_x86_feature_detected!("avx2")`.
                        unsafe { avx2::search_mask_u8(&buf, dense as u8) }
                    }
                    PartialKeys::U16(keys) => {
                        let mut buf = [0u16; 32];
                        buf[..n].copy_from_slice(keys);
                        // SAFETY: guarded by `is_x86_feature_detected!("avx2")`.
                        unsafe { avx2::search_mask_u16(&buf, dense as u16) }
                    }
                    PartialKeys::U32(keys) => {
                        let mut buf = [0u32; 32];
                        buf[..n].copy_from_slice(keys);
                        // SAFETY: guarded by `is_x86_feature_detected!("avx2")`.
                        unsafe { avx2::search_mask_u32(&buf, dense) }
                    }
                };
                return mask & n_mask;
            }
        }

        search_mask_scalar(self.partial_keys(), n, dense)
    }
}

/// Frees every node reachable from `root`; leaves are values and stay untouched.
///
/// # Safety
///
/// No other thread may reach or read the subtree any more.
pub(crate) unsafe fn free_subtree(root: ChildPointer) {
    let mut pending: Vec<NodePtr> = root.as_node().into_iter().collect();
    while let Some(node) = pending.pop() {
        pending.extend((0..node.len()).filter_map(|i| node.child(i).as_node()));
        // SAFETY: each node is reached exactly once in a tree.
        unsafe { node.free() };
    }
}

#[inline]
pub(crate) fn search_mask_scalar(keys: PartialKeys<'_>, n: usize, dense: u32) -> u32 {
    let mut mask = 0u32;
    for i in 0..n {
        let pk = keys.get(i);
        if (dense & pk) == pk {
            mask |= 1u32 << i;
        }
    }
    mask
}

// The AVX2 kernels test all 32 partial-key slots at once. A lane becomes all
// ones when `key & dense == key`; wider lanes are then narrowed to one byte per
// entry so a single movemask yields bit `i` for entry `i`. `packs` narrows each
// 128-bit half on its own, which interleaves the two inputs, so every
// narrowing is followed by `unshuffle`. Slots past `len` are zero and always
// match; callers mask them off.
#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn unshuffle(packed: __m256i) -> __m256i {
        _mm256_permutevar8x32_epi32(packed, _mm256_set_epi32(7, 6, 3, 2, 5, 4, 1, 0))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn subset_u8(keys: *const u8, dense: __m256i) -> __m256i {
        unsafe {
            let keys = _mm256_loadu_si256(keys.cast());
            _mm256_cmpeq_epi8(_mm256_and_si256(keys, dense), keys)
        }
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn subset_u16(keys: *const u16, dense: __m256i) -> __m256i {
        unsafe {
            let keys = _mm256_loadu_si256(keys.cast());
            _mm256_cmpeq_epi16(_mm256_and_si256(keys, dense), keys)
        }
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn subset_u32(keys: *const u32, dense: __m256i) -> __m256i {
        unsafe {
            let keys = _mm256_loadu_si256(keys.cast());
            _mm256_cmpeq_epi32(_mm256_and_si256(keys, dense), keys)
        }
    }

    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn search_mask_u8(partials: &[u8; 32], dense: u8) -> u32 {
        unsafe {
            let hits = subset_u8(partials.as_ptr(), _mm256_set1_epi8(dense as i8));
            _mm256_movemask_epi8(hits) as u32
        }
    }

    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn search_mask_u16(partials: &[u16; 32], dense: u16) -> u32 {
        unsafe {
            let dense = _mm256_set1_epi16(dense as i16);
            let keys = partials.as_ptr();
            let low = subset_u16(keys, dense);
            let high = subset_u16(keys.add(16), dense);
            _mm256_movemask_epi8(unshuffle(_mm256_packs_epi16(low, high))) as u32
        }
    }

    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn search_mask_u32(partials: &[u32; 32], dense: u32) -> u32 {
        unsafe {
            let dense = _mm256_set1_epi32(dense as i32);
            let keys = partials.as_ptr();
            let low = unshuffle(_mm256_packs_epi32(subset_u32(keys, dense), subset_u32(keys.add(8), dense)));
            let high = unshuffle(_mm256_packs_epi32(
                subset_u32(keys.add(16), dense),
                subset_u32(keys.add(24), dense),
            ));
            _mm256_movemask_epi8(unshuffle(_mm256_packs_epi16(low, high))) as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn leaves(n: usize) -> Vec<ChildPointer> {
        (0..n as u64).map(ChildPointer::leaf).collect()
    }

    #[test]
    fn test_allocate_and_read_back() {
        // Three entries over bits {3, 5}: 0b00, 0b01, 0b10.
        let mapping = PartialKeyMapping::build_minimal(&[3, 5]);
        let node = NodePtr::allocate(mapping, &[0, 0b01, 0b10], &leaves(3));
        assert_eq!(node.len(), 3);
        assert_eq!(node.kind(), NodeKind::SingleMask8);
        assert_eq!(node.height(), 1);
        assert_eq!(node.most_significant_bit(), 3);
        assert_eq!(node.partial_keys().get(2), 0b10);
        assert_eq!(node.child(1), ChildPointer::leaf(1));
        assert!(node.memory_size() >= HEADER_SIZE + 3 * 8);

        node.store_child(1, ChildPointer::leaf(99));
        assert_eq!(node.child(1).leaf_id(), Some(99));

        // Key with bit 3 set routes to entry 2, bit 5 only to entry 1.
        assert_eq!(node.search_index(&[0b0001_0000]), 2);
        assert_eq!(node.search_index(&[0b0000_0100]), 1);
        assert_eq!(node.search_index(&[0]), 0);

        // SAFETY: never published.
        unsafe { node.free() };
    }

    #[test]
    fn test_height_is_one_above_tallest_child() {
        let mapping = PartialKeyMapping::build_minimal(&[0]);
        let lower = NodePtr::allocate(mapping, &[0, 1], &leaves(2));
        let upper = NodePtr::allocate(mapping, &[0, 1], &[ChildPointer::leaf(7), ChildPointer::node(lower)]);
        assert_eq!(upper.height(), 2);
        assert_eq!(ChildPointer::node(upper).height(), 2);
        // SAFETY: never published.
        unsafe {
            upper.free();
            lower.free();
        }
    }

    #[test]
    fn test_lock_protocol() {
        let mapping = PartialKeyMapping::build_minimal(&[0]);
        let node = NodePtr::allocate(mapping, &[0, 1], &leaves(2));
        let v0 = node.version();
        assert!(node.try_lock());
        node.unlock();
        assert_eq!(node.version(), v0 + 1);

        assert!(node.try_lock());
        node.mark_obsolete();
        node.unlock();
        assert!(node.is_obsolete());
        assert!(!node.try_lock());
        // SAFETY: never published.
        unsafe { node.free() };
    }

    #[test]
    fn test_search_mask_matches_scalar() {
        let mut rng = StdRng::seed_from_u64(11);
        for &bits in &[5usize, 12, 20, 31] {
            let positions: Vec<u16> = (0..bits as u16).collect();
            let mapping = PartialKeyMapping::build_minimal(&positions);
            for n in 2..=MAX_ENTRIES {
                let mut keys: Vec<u32> = (0..n).map(|_| rng.gen::<u32>() & ((1u64 << bits) - 1) as u32).collect();
                keys[0] = 0;
                let node = NodePtr::allocate(mapping, &keys, &leaves(n));
                for _ in 0..64 {
                    let dense = rng.gen::<u32>() & ((1u64 << bits) - 1) as u32;
                    assert_eq!(
                        node.search_mask(dense),
                        search_mask_scalar(node.partial_keys(), n, dense),
                        "kind={:?} n={n}",
                        node.kind()
                    );
                }
                // SAFETY: never published.
                unsafe { node.free() };
            }
        }
    }
}
