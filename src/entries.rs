// =============================================================================
// Staged node contents (insert / split / compress / delete / merge)
// =============================================================================
//
// All structural operations run on an `Entries` value: a node's discriminative
// bits plus its sparse partial keys widened to `u32`. Published nodes are never
// edited in place; an operation stages the new contents and allocates a fresh
// node with the cheapest mapping for the resulting bit set.
//
// Canonical code: with discriminative bits b_0 < b_1 < ... < b_{k-1}, bit b_i
// occupies code bit `1 << (k - 1 - i)`.

use crate::bits::{pext_u32, DiscriminativeBit, DiscriminativeBits};
use crate::child::ChildPointer;
use crate::mapping::PartialKeyMapping;
use crate::node::{NodePtr, MAX_ENTRIES};

/// Where a new entry goes: the subtree (contiguous entry range) sharing the
/// new key's prefix up to the mismatching bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct InsertInformation {
    /// Partial-key bits of the affected subtree that precede the new bit.
    pub(crate) prefix: u32,
    pub(crate) first: usize,
    pub(crate) count: usize,
    pub(crate) bit: DiscriminativeBit,
}

impl InsertInformation {
    /// The new bit becomes the root of the whole node.
    pub(crate) fn whole_node(len: usize, bit: DiscriminativeBit) -> Self {
        Self { prefix: 0, first: 0, count: len, bit }
    }
}

/// A binary Patricia node: one discriminative bit, two subtrees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BiNode {
    pub(crate) bit: u16,
    pub(crate) height: u16,
    pub(crate) left: ChildPointer,
    pub(crate) right: ChildPointer,
}

impl BiNode {
    pub(crate) fn new(bit: u16, left: ChildPointer, right: ChildPointer) -> Self {
        Self {
            bit,
            height: 1 + left.height().max(right.height()),
            left,
            right,
        }
    }

    /// Orders `existing` and `new` by the value the new key has at `bit`.
    pub(crate) fn from_existing_and_new(
        bit: DiscriminativeBit,
        existing: ChildPointer,
        new: ChildPointer,
    ) -> Self {
        if bit.value {
            Self::new(bit.absolute, existing, new)
        } else {
            Self::new(bit.absolute, new, existing)
        }
    }

    /// Materializes the BiNode as a two-entry node.
    pub(crate) fn into_node(self) -> ChildPointer {
        Entries::two(&self).allocate()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EntryRange {
    pub(crate) first: usize,
    pub(crate) count: usize,
}

/// The BiNode directly above an entry, as seen inside its node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ParentBiNode {
    pub(crate) bit: u16,
    /// Code bit of `bit` in the node's canonical code.
    pub(crate) mask: u32,
    pub(crate) left: EntryRange,
    pub(crate) right: EntryRange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DeletionInformation {
    /// Code bits still needed once the entry is gone.
    pub(crate) compression_mask: u32,
    pub(crate) index: usize,
    /// Side of the parent BiNode the removed entry hangs on (`true` = right).
    pub(crate) value: bool,
    pub(crate) binode: ParentBiNode,
}

impl DeletionInformation {
    /// The removed entry's sibling is a single entry.
    #[inline]
    pub(crate) fn has_direct_neighbour(&self) -> bool {
        self.binode.left.count + self.binode.right.count == 2
    }

    #[inline]
    pub(crate) fn direct_neighbour_index(&self) -> usize {
        self.binode.right.first - usize::from(self.value)
    }
}

#[derive(Clone)]
pub(crate) struct Entries {
    bits: DiscriminativeBits,
    keys: [u32; MAX_ENTRIES],
    children: [ChildPointer; MAX_ENTRIES],
    len: usize,
}

impl std::fmt::Debug for Entries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entries")
            .field("bits", &self.bits.as_slice())
            .field("keys", &&self.keys[..self.len])
            .field("children", &&self.children[..self.len])
            .finish()
    }
}

/// Opens a zero bit at code position `at`, moving higher bits up by one.
#[inline]
fn widen_code(code: u32, at: u32) -> u32 {
    debug_assert!(at <= 31);
    let code = u64::from(code);
    let below = code & ((1u64 << at) - 1);
    (((code >> at) << (at + 1)) | below) as u32
}

impl Entries {
    fn with_bits(bits: DiscriminativeBits) -> Self {
        Self {
            bits,
            keys: [0; MAX_ENTRIES],
            children: [ChildPointer::EMPTY; MAX_ENTRIES],
            len: 0,
        }
    }

    pub(crate) fn single(child: ChildPointer) -> Self {
        let mut out = Self::with_bits(DiscriminativeBits::new());
        out.children[0] = child;
        out.len = 1;
        out
    }

    pub(crate) fn two(binode: &BiNode) -> Self {
        let mut bits = DiscriminativeBits::new();
        bits.push(binode.bit);
        let mut out = Self::with_bits(bits);
        out.keys[1] = 1;
        out.children[0] = binode.left;
        out.children[1] = binode.right;
        out.len = 2;
        out
    }

    pub(crate) fn from_node(node: NodePtr) -> Self {
        let mut out = Self::with_bits(node.mapping().discriminative_bits());
        let len = node.len();
        let keys = node.partial_keys();
        for i in 0..len {
            out.keys[i] = keys.get(i);
            out.children[i] = node.child(i);
        }
        out.len = len;
        out
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn bits(&self) -> &[u16] {
        &self.bits
    }

    #[inline]
    pub(crate) fn key(&self, idx: usize) -> u32 {
        self.keys[idx]
    }

    #[inline]
    pub(crate) fn child(&self, idx: usize) -> ChildPointer {
        self.children[idx]
    }

    #[inline]
    pub(crate) fn children(&self) -> &[ChildPointer] {
        &self.children[..self.len]
    }

    #[inline]
    pub(crate) fn set_child(&mut self, idx: usize, child: ChildPointer) {
        debug_assert!(idx < self.len);
        self.children[idx] = child;
    }

    /// Publishes the staged contents; a single entry collapses to the entry itself.
    pub(crate) fn allocate(&self) -> ChildPointer {
        match self.len {
            0 => ChildPointer::EMPTY,
            1 => self.children[0],
            len => {
                let mapping = PartialKeyMapping::build_minimal(&self.bits);
                let node = NodePtr::allocate(mapping, &self.keys[..len], &self.children[..len]);
                ChildPointer::node(node)
            }
        }
    }

    /// Code bits of every discriminative bit more significant than `bit`.
    pub(crate) fn prefix_mask(&self, bit: u16) -> u32 {
        let k = self.bits.len();
        let r = self.bits.partition_point(|&b| b < bit);
        if r == 0 {
            0
        } else {
            (((1u64 << r) - 1) << (k - r)) as u32
        }
    }

    /// Absolute bit for a single code bit.
    #[inline]
    fn bit_for_code(&self, code: u32) -> u16 {
        debug_assert_eq!(code.count_ones(), 1);
        self.bits[self.bits.len() - 1 - code.trailing_zeros() as usize]
    }

    /// Entries sharing `entry_index`'s partial-key bits above `bit`.
    fn affected_range(&self, entry_index: usize, bit: u16) -> (u32, EntryRange) {
        debug_assert!(entry_index < self.len);
        let mask = self.prefix_mask(bit);
        let prefix = self.keys[entry_index] & mask;
        let keys = &self.keys[..self.len];
        let first = keys
            .iter()
            .position(|&k| k & mask == prefix)
            .unwrap_or(entry_index);
        let count = keys[first..].iter().take_while(|&&k| k & mask == prefix).count();
        debug_assert!((first..first + count).contains(&entry_index));
        (prefix, EntryRange { first, count })
    }

    pub(crate) fn insert_information(&self, entry_index: usize, bit: DiscriminativeBit) -> InsertInformation {
        let (prefix, range) = self.affected_range(entry_index, bit.absolute);
        InsertInformation {
            prefix,
            first: range.first,
            count: range.count,
            bit,
        }
    }

    /// Inserts `child` as the sibling of the affected subtree at `info.bit`.
    pub(crate) fn add_entry(&self, info: &InsertInformation, child: ChildPointer) -> Entries {
        debug_assert!(self.len < MAX_ENTRIES);
        let k = self.bits.len();
        let d = info.bit.absolute;

        let mut bits = self.bits.clone();
        let (recode_at, add_mask) = match self.bits.binary_search(&d) {
            Ok(i) => (None, 1u32 << (k - 1 - i)),
            Err(r) => {
                bits.insert(r, d);
                let new_pos = (k - r) as u32;
                (Some(new_pos), 1u32 << new_pos)
            }
        };
        let recode = |key: u32| match recode_at {
            Some(pos) => widen_code(key, pos),
            None => key,
        };

        let mut out = Self::with_bits(bits);
        let range = info.first..info.first + info.count;
        let insert_at = if info.bit.value { range.end } else { range.start };
        for i in 0..self.len {
            let j = if i < insert_at { i } else { i + 1 };
            let mut key = recode(self.keys[i]);
            if !info.bit.value && range.contains(&i) {
                key |= add_mask;
            }
            out.keys[j] = key;
            out.children[j] = self.children[i];
        }
        let prefix = recode(info.prefix);
        out.keys[insert_at] = if info.bit.value { prefix | add_mask } else { prefix };
        out.children[insert_at] = child;
        out.len = self.len + 1;
        out.keys[0] = 0;
        out
    }

    /// Code bits that tell the entries `start..start + count` apart: each
    /// neighbouring pair contributes the bits the right one sets anew.
    fn distinguishing_bits(&self, start: usize, count: usize) -> u32 {
        self.keys[start..start + count]
            .windows(2)
            .fold(0, |bits, pair| bits | (pair[1] & !pair[0]))
    }

    fn extract_bits(&self, code_mask: u32) -> DiscriminativeBits {
        let k = self.bits.len();
        self.bits
            .iter()
            .enumerate()
            .filter(|&(i, _)| code_mask & (1u32 << (k - 1 - i)) != 0)
            .map(|(_, &b)| b)
            .collect()
    }

    /// The entries `start..start + count` as their own node contents.
    pub(crate) fn compress(&self, start: usize, count: usize) -> Entries {
        debug_assert!(count >= 1 && start + count <= self.len);
        let mask = self.distinguishing_bits(start, count);
        let mut out = Self::with_bits(self.extract_bits(mask));
        for j in 0..count {
            out.keys[j] = pext_u32(self.keys[start + j], mask);
            out.children[j] = self.children[start + j];
        }
        out.len = count;
        out.keys[0] = 0;
        out
    }

    fn compress_and_add(&self, start: usize, count: usize, info: &InsertInformation, child: ChildPointer) -> ChildPointer {
        if count == 1 {
            debug_assert_eq!(info.first, start);
            return BiNode::from_existing_and_new(info.bit, self.children[start], child).into_node();
        }
        let compressed = self.compress(start, count);
        let info = compressed.insert_information(info.first - start, info.bit);
        compressed.add_entry(&info, child).allocate()
    }

    /// Splits a full node at its root BiNode and adds `child` to the half that
    /// holds the affected subtree.
    pub(crate) fn split(&self, info: &InsertInformation, child: ChildPointer) -> BiNode {
        let k = self.bits.len();
        debug_assert!(k > 0);
        let top = 1u32 << (k - 1);
        let smaller = self.keys[..self.len].iter().take_while(|&&key| key & top == 0).count();
        debug_assert!(smaller > 0 && smaller < self.len);

        let (left, right) = if info.first < smaller {
            debug_assert!(info.first + info.count <= smaller);
            (
                self.compress_and_add(0, smaller, info, child),
                self.compress(smaller, self.len - smaller).allocate(),
            )
        } else {
            (
                self.compress(0, smaller).allocate(),
                self.compress_and_add(smaller, self.len - smaller, info, child),
            )
        };
        BiNode::new(self.bits[0], left, right)
    }

    /// `true` if the entry is the right child of the BiNode directly above it.
    ///
    /// That BiNode splits the entry from whichever neighbour shares the longer
    /// code prefix with it, so compare the overlaps on both sides.
    fn is_right_child(&self, idx: usize) -> bool {
        debug_assert!(self.len >= 2 && idx < self.len);
        match (idx.checked_sub(1), idx + 1 < self.len) {
            (None, _) => false,
            (Some(_), false) => true,
            (Some(left), true) => {
                let key = self.keys[idx];
                (self.keys[left] & key) >= (key & self.keys[idx + 1])
            }
        }
    }

    /// Code bits still needed once entry `idx` is gone. Its sibling range takes
    /// over its place, so the entries split into two runs at that point.
    fn distinguishing_bits_without(&self, idx: usize) -> u32 {
        if self.len <= 2 {
            return 0;
        }
        let first_range_len = idx + usize::from(!self.is_right_child(idx));
        self.distinguishing_bits(0, first_range_len)
            | self.distinguishing_bits(first_range_len, self.len - first_range_len)
    }

    pub(crate) fn parent_binode(&self, idx: usize) -> ParentBiNode {
        let value = usize::from(self.is_right_child(idx));
        let left_last = self.keys[idx - value];
        let right_first = self.keys[idx + 1 - value];
        let diff = (left_last & right_first) ^ right_first;
        debug_assert_ne!(diff, 0);
        let mask = diff & diff.wrapping_neg();
        let bit = self.bit_for_code(mask);

        let (_, range) = self.affected_range(idx, bit);
        let left_count = if value == 1 { range.count - 1 } else { 1 };
        ParentBiNode {
            bit,
            mask,
            left: EntryRange {
                first: range.first,
                count: left_count,
            },
            right: EntryRange {
                first: range.first + left_count,
                count: range.count - left_count,
            },
        }
    }

    pub(crate) fn deletion_information(&self, idx: usize) -> DeletionInformation {
        DeletionInformation {
            compression_mask: self.distinguishing_bits_without(idx),
            index: idx,
            value: self.is_right_child(idx),
            binode: self.parent_binode(idx),
        }
    }

    /// Drops an entry together with the BiNode directly above it.
    pub(crate) fn remove_entry(&self, deletion: &DeletionInformation) -> Entries {
        let idx = deletion.index;
        if self.len == 2 {
            return Self::single(self.children[1 - idx]);
        }

        let mask = deletion.compression_mask;
        let mut out = Self::with_bits(self.extract_bits(mask));
        let compressed_disc = pext_u32(deletion.binode.mask, mask);
        let range = deletion.binode.left.first..deletion.binode.right.first + deletion.binode.right.count;
        let mut j = 0;
        for i in (0..self.len).filter(|&i| i != idx) {
            let mut key = pext_u32(self.keys[i], mask);
            if range.contains(&i) {
                key &= !compressed_disc;
            }
            out.keys[j] = key;
            out.children[j] = self.children[i];
            j += 1;
        }
        out.len = j;
        out.keys[0] = 0;
        out
    }

    /// Removes an entry and adds `child` as a new top-level entry at `bit`.
    pub(crate) fn remove_and_add_entry(
        &self,
        deletion: &DeletionInformation,
        bit: DiscriminativeBit,
        child: ChildPointer,
    ) -> Entries {
        let remaining = self.remove_entry(deletion);
        let added = Self::single(child);
        if bit.value {
            Self::merge(bit.absolute, &remaining, &added)
        } else {
            Self::merge(bit.absolute, &added, &remaining)
        }
    }

    /// Code masks of this node's bits inside the code of `target` (a superset).
    fn deposit_masks(&self, target: &[u16]) -> [u32; MAX_ENTRIES] {
        let mut masks = [0u32; MAX_ENTRIES];
        let k = self.bits.len();
        for (i, b) in self.bits.iter().enumerate() {
            let (Ok(j) | Err(j)) = target.binary_search(b);
            masks[k - 1 - i] = 1u32 << (target.len() - 1 - j);
        }
        masks
    }

    fn deposit(key: u32, masks: &[u32; MAX_ENTRIES]) -> u32 {
        let mut out = 0u32;
        let mut rest = key;
        while rest != 0 {
            let pos = rest.trailing_zeros() as usize;
            out |= masks[pos];
            rest &= rest - 1;
        }
        out
    }

    /// Joins two sibling subtrees under a new root BiNode at `root_bit`, which
    /// must be more significant than every bit of either side.
    pub(crate) fn merge(root_bit: u16, left: &Entries, right: &Entries) -> Entries {
        debug_assert!(left.len + right.len <= MAX_ENTRIES);
        debug_assert!(left.bits.iter().chain(right.bits.iter()).all(|&b| b > root_bit));

        let mut bits = DiscriminativeBits::new();
        bits.push(root_bit);
        bits.extend(left.bits.iter().chain(right.bits.iter()).copied());
        bits.sort_unstable();
        bits.dedup();

        let left_masks = left.deposit_masks(&bits);
        let right_masks = right.deposit_masks(&bits);
        let root_mask = 1u32 << (bits.len() - 1);

        let mut out = Self::with_bits(bits);
        for i in 0..left.len {
            out.keys[i] = Self::deposit(left.keys[i], &left_masks);
            out.children[i] = left.children[i];
        }
        for i in 0..right.len {
            out.keys[left.len + i] = Self::deposit(right.keys[i], &right_masks) | root_mask;
            out.children[left.len + i] = right.children[i];
        }
        out.len = left.len + right.len;
        out.keys[0] = 0;
        out
    }

    /// Number of BiNodes between the node root and each entry.
    pub(crate) fn entry_depths(&self) -> [u8; MAX_ENTRIES] {
        let mut depths = [0u8; MAX_ENTRIES];
        self.fill_depths(0, self.len, 0, &mut depths);
        depths
    }

    fn fill_depths(&self, start: usize, count: usize, depth: u8, out: &mut [u8; MAX_ENTRIES]) {
        if count <= 1 {
            out[start] = depth;
            return;
        }
        let relevant = self.distinguishing_bits(start, count);
        let top = 1u32 << (31 - relevant.leading_zeros());
        let left = self.keys[start..start + count]
            .iter()
            .take_while(|&&k| k & top == 0)
            .count();
        self.fill_depths(start, left, depth + 1, out);
        self.fill_depths(start + left, count - left, depth + 1, out);
    }

    /// Structural checks on a staged node; returns a description of the first violation.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.len < 2 {
            return Err(format!("node with {} entries", self.len));
        }
        if self.keys[0] != 0 {
            return Err(format!("first partial key is {:#x}", self.keys[0]));
        }
        if self.bits.len() >= self.len {
            return Err(format!("{} bits for {} entries", self.bits.len(), self.len));
        }
        if !self.bits.windows(2).all(|w| w[0] < w[1]) {
            return Err(format!("unsorted bits {:?}", self.bits.as_slice()));
        }
        if !self.keys[..self.len].windows(2).all(|w| w[0] < w[1]) {
            return Err(format!("partial keys not ascending: {:?}", &self.keys[..self.len]));
        }
        let all_bits = if self.bits.len() == 32 { !0 } else { (1u32 << self.bits.len()) - 1 };
        if self.distinguishing_bits(0, self.len) != all_bits {
            return Err("node carries an unused discriminative bit".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::mismatch;

    fn leaf(id: u64) -> ChildPointer {
        ChildPointer::leaf(id)
    }

    /// Entries {00, 01, 10} over bits [3, 5].
    fn three() -> Entries {
        let two = Entries::two(&BiNode::new(5, leaf(0), leaf(1)));
        let bit = DiscriminativeBit::new(3, true);
        let info = InsertInformation::whole_node(2, bit);
        two.add_entry(&info, leaf(2))
    }

    #[test]
    fn test_add_entry_as_new_root() {
        let e = three();
        assert_eq!(e.bits(), &[3, 5]);
        assert_eq!(&e.keys[..3], &[0b00, 0b01, 0b10]);
        assert_eq!(e.children(), &[leaf(0), leaf(1), leaf(2)]);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_add_entry_inside_subtree_with_zero_bit() {
        // New entry left of entry 1 at bit 6: {00, 01} subtree gains 0b010 / 0b011.
        let e = three();
        let info = e.insert_information(1, DiscriminativeBit::new(6, false));
        assert_eq!((info.first, info.count), (1, 1));
        let out = e.add_entry(&info, leaf(9));
        assert_eq!(out.bits(), &[3, 5, 6]);
        assert_eq!(&out.keys[..4], &[0b000, 0b010, 0b011, 0b100]);
        assert_eq!(out.children(), &[leaf(0), leaf(9), leaf(1), leaf(2)]);
        assert!(out.validate().is_ok());
    }

    #[test]
    fn test_prefix_mask() {
        let e = three();
        assert_eq!(e.prefix_mask(0), 0);
        assert_eq!(e.prefix_mask(4), 0b10);
        assert_eq!(e.prefix_mask(5), 0b10);
        assert_eq!(e.prefix_mask(9), 0b11);
    }

    #[test]
    fn test_parent_binode_and_deletion() {
        let e = three();

        let d = e.deletion_information(2);
        assert!(d.value);
        assert_eq!(d.binode.bit, 3);
        assert_eq!(d.binode.left, EntryRange { first: 0, count: 2 });
        assert_eq!(d.binode.right, EntryRange { first: 2, count: 1 });
        assert!(!d.has_direct_neighbour());
        let removed = e.remove_entry(&d);
        assert_eq!(removed.bits(), &[5]);
        assert_eq!(&removed.keys[..2], &[0, 1]);
        assert_eq!(removed.children(), &[leaf(0), leaf(1)]);

        let d = e.deletion_information(0);
        assert!(!d.value);
        assert_eq!(d.binode.bit, 5);
        assert!(d.has_direct_neighbour());
        assert_eq!(d.direct_neighbour_index(), 1);
        let removed = e.remove_entry(&d);
        assert_eq!(removed.bits(), &[3]);
        assert_eq!(&removed.keys[..2], &[0, 1]);
        assert_eq!(removed.children(), &[leaf(1), leaf(2)]);
    }

    #[test]
    fn test_remove_from_two_entries_collapses() {
        let two = Entries::two(&BiNode::new(5, leaf(0), leaf(1)));
        let d = two.deletion_information(1);
        let out = two.remove_entry(&d);
        assert_eq!(out.len(), 1);
        assert_eq!(out.allocate(), leaf(0));
    }

    #[test]
    fn test_merge() {
        let left = three();
        let right = Entries::two(&BiNode::new(4, leaf(3), leaf(4)));
        let merged = Entries::merge(1, &left, &right);
        assert_eq!(merged.bits(), &[1, 3, 4, 5]);
        assert_eq!(&merged.keys[..5], &[0b0000, 0b0001, 0b0100, 0b1000, 0b1010]);
        assert!(merged.validate().is_ok());

        let single = Entries::single(leaf(7));
        let merged = Entries::merge(2, &single, &left);
        assert_eq!(merged.bits(), &[2, 3, 5]);
        assert_eq!(&merged.keys[..4], &[0b000, 0b100, 0b101, 0b110]);
        assert_eq!(merged.child(0), leaf(7));
    }

    #[test]
    fn test_remove_and_add_entry() {
        let e = three();
        let d = e.deletion_information(2);
        let out = e.remove_and_add_entry(&d, DiscriminativeBit::new(1, false), leaf(8));
        assert_eq!(out.bits(), &[1, 5]);
        assert_eq!(&out.keys[..3], &[0b00, 0b10, 0b11]);
        assert_eq!(out.children(), &[leaf(8), leaf(0), leaf(1)]);
    }

    #[test]
    fn test_entry_depths() {
        let e = three();
        assert_eq!(&e.entry_depths()[..3], &[2, 2, 1]);
        let two = Entries::two(&BiNode::new(5, leaf(0), leaf(1)));
        assert_eq!(&two.entry_depths()[..2], &[1, 1]);
    }

    #[test]
    fn test_compress_and_split() {
        // Build a node over single-byte keys 0..16 by repeated top-level adds.
        let keys: Vec<[u8; 1]> = (0u8..16).map(|k| [k << 4]).collect();
        let mut e = Entries::two(&BiNode::new(3, leaf(0), leaf(1)));
        for id in 2..16usize {
            // Ascending inserts: the predecessor shares the longest prefix.
            let new_key = keys[id];
            let existing = id - 1;
            let bit = mismatch(&keys[existing], &new_key).unwrap();
            let info = e.insert_information(existing, bit);
            e = e.add_entry(&info, leaf(id as u64));
            assert!(e.validate().is_ok(), "{e:?}");
        }
        assert_eq!(e.bits(), &[0, 1, 2, 3]);
        for i in 0..16 {
            assert_eq!(e.key(i), i as u32);
        }

        let upper = e.compress(8, 8);
        assert_eq!(upper.bits(), &[1, 2, 3]);
        assert_eq!(upper.key(7), 7);
        assert_eq!(upper.child(0), leaf(8));

        let info = e.insert_information(15, mismatch(&keys[15], &[0xF8]).unwrap());
        let split = e.split(&info, leaf(99));
        assert_eq!(split.bit, 0);
        assert_eq!(split.height, 2);
        let right = split.right.as_node().unwrap();
        assert_eq!(right.len(), 9);
        assert_eq!(right.child(8), leaf(99));
        let left = split.left.as_node().unwrap();
        assert_eq!(left.len(), 8);
        // SAFETY: never published.
        unsafe {
            right.free();
            left.free();
        }
    }
}
