// =============================================================================
// Single-threaded HOT
// =============================================================================
//
// Insert walks down to the leaf a key routes to, finds the first bit where the
// stored key and the new key differ, and integrates the new leaf at the node
// whose BiNode structure that bit belongs to:
//
// - room left          : add the entry in a fresh copy of the node
// - full, bit below msb: split the node and push the split BiNode upwards
// - full otherwise     : put a new two-entry node above it
//
// A BiNode pushed into a parent of greater height becomes an intermediate
// node; otherwise it is pulled up into the parent, which may split in turn.
// Only a split of the root makes the tree taller.
//
// Delete removes the leaf's entry and, where possible, merges the node with
// its sibling or absorbs a shorter sibling so nodes stay dense.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use smallvec::SmallVec;
use tracing::trace;

use crate::bits::{keys_equal, mismatch, DiscriminativeBit};
use crate::child::{Child, ChildPointer};
use crate::entries::{BiNode, DeletionInformation, Entries, InsertInformation};
use crate::error::{check_entry, Result};
use crate::iter::{Cursor, Iter};
use crate::key::{KeyExtractor, ValueId};
use crate::node::{free_subtree, NodePtr, MAX_ENTRIES};
use crate::stats;

/// One node on the path to a leaf and the entry the path follows.
#[derive(Clone, Copy, Debug)]
struct InsertFrame {
    node: NodePtr,
    index: usize,
    msb: u16,
}

type InsertStack = SmallVec<[InsertFrame; 16]>;

/// Ordered index of values whose keys are derived by an extractor `E`.
///
/// Leaves store only the value (as a [`ValueId`]); keys are recomputed from
/// values whenever the trie needs to compare them.
pub struct HotSingleThreaded<V, E> {
    root: ChildPointer,
    len: usize,
    extractor: E,
    _values: PhantomData<fn() -> V>,
}

impl<V, E> HotSingleThreaded<V, E> {
    pub fn new(extractor: E) -> Self {
        Self {
            root: ChildPointer::EMPTY,
            len: 0,
            extractor,
            _values: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Nodes on the longest root-to-leaf path (0 for an empty or single-value trie).
    #[inline]
    pub fn height(&self) -> usize {
        usize::from(self.root.height())
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    /// Memory held by nodes and the statistics counters.
    pub fn statistics(&self) -> (usize, BTreeMap<String, f64>) {
        stats::collect(self.root)
    }
}

impl<V: ValueId, E: KeyExtractor<V>> HotSingleThreaded<V, E> {
    #[inline]
    fn key_of_id(&self, id: u64) -> E::Key {
        self.extractor.key_of(&V::from_id(id))
    }

    pub fn lookup(&self, key: &[u8]) -> Option<V> {
        let mut current = self.root;
        loop {
            match current.decode() {
                Child::Empty => return None,
                Child::Leaf(id) => {
                    return keys_equal(self.key_of_id(id).as_ref(), key).then(|| V::from_id(id));
                }
                Child::Node(node) => current = node.child(node.search_index(key)),
            }
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.lookup(key).is_some()
    }

    /// Inserts `value` unless a value with the same key exists. Returns whether it was inserted.
    ///
    /// A value whose key is longer than [`MAX_KEY_LEN`](crate::MAX_KEY_LEN) or
    /// whose id exceeds [`MAX_VALUE_ID`](crate::MAX_VALUE_ID) is not stored and
    /// `false` is returned; [`try_insert`](Self::try_insert) reports why.
    pub fn insert(&mut self, value: V) -> bool {
        matches!(self.put(value, false), Ok(None))
    }

    pub fn try_insert(&mut self, value: V) -> Result<bool> {
        self.put(value, false).map(|existing| existing.is_none())
    }

    /// Inserts `value`, replacing the value with the same key. Returns the replaced value.
    ///
    /// Values [`insert`](Self::insert) would reject leave the trie unchanged
    /// and return `None`; use [`try_upsert`](Self::try_upsert) to tell the cases apart.
    pub fn upsert(&mut self, value: V) -> Option<V> {
        self.put(value, true).ok().flatten().map(V::from_id)
    }

    pub fn try_upsert(&mut self, value: V) -> Result<Option<V>> {
        self.put(value, true).map(|existing| existing.map(V::from_id))
    }

    /// Returns the id of the value already stored under the key, if any.
    fn put(&mut self, value: V, replace: bool) -> Result<Option<u64>> {
        let key_holder = self.extractor.key_of(&value);
        let key = key_holder.as_ref();
        let id = value.into_id();
        check_entry(key, id)?;
        let new_leaf = ChildPointer::leaf(id);

        Ok(match self.root.decode() {
            Child::Empty => {
                self.root = new_leaf;
                self.len += 1;
                None
            }
            Child::Leaf(existing) => match mismatch(self.key_of_id(existing).as_ref(), key) {
                None => {
                    if replace {
                        self.root = new_leaf;
                    }
                    Some(existing)
                }
                Some(bit) => {
                    self.root = BiNode::from_existing_and_new(bit, self.root, new_leaf).into_node();
                    self.len += 1;
                    None
                }
            },
            Child::Node(_) => {
                let (stack, existing) = self.search_stack(key);
                match mismatch(self.key_of_id(existing).as_ref(), key) {
                    None => {
                        if replace {
                            if let Some(frame) = stack.last() {
                                frame.node.store_child(frame.index, new_leaf);
                            }
                        }
                        Some(existing)
                    }
                    Some(bit) => {
                        self.insert_at(&stack, bit, new_leaf);
                        self.len += 1;
                        None
                    }
                }
            }
        })
    }

    /// Path from the root node to the leaf `key` routes to, and that leaf's id.
    fn search_stack(&self, key: &[u8]) -> (InsertStack, u64) {
        let mut stack = InsertStack::new();
        let mut current = self.root;
        loop {
            match current.decode() {
                Child::Node(node) => {
                    let index = node.search_index(key);
                    stack.push(InsertFrame {
                        node,
                        index,
                        msb: node.most_significant_bit(),
                    });
                    current = node.child(index);
                }
                Child::Leaf(id) => return (stack, id),
                // Child slots of a node are never empty.
                Child::Empty => unreachable!("empty child slot below the root"),
            }
        }
    }

    /// Stores `replacement` where the node (or leaf) at `depth` hangs.
    fn replace_slot(&mut self, stack: &[InsertFrame], depth: usize, replacement: ChildPointer) {
        if depth == 0 {
            self.root = replacement;
        } else {
            let parent = stack[depth - 1];
            parent.node.store_child(parent.index, replacement);
        }
    }

    fn insert_at(&mut self, stack: &[InsertFrame], bit: DiscriminativeBit, new_leaf: ChildPointer) {
        let leaf_depth = stack.len();
        let mut depth = 0;
        while depth + 1 < leaf_depth && bit.absolute > stack[depth + 1].msb {
            depth += 1;
        }

        let frame = stack[depth];
        let entries = Entries::from_node(frame.node);
        let info = entries.insert_information(frame.index, bit);

        if info.count == 1 && depth + 1 == leaf_depth {
            let leaf = entries.child(frame.index);
            self.integrate_binode(stack, leaf_depth, BiNode::from_existing_and_new(bit, leaf, new_leaf));
        } else if info.count == 1 {
            // The affected entry is a whole child node: the new bit becomes its root.
            let child = stack[depth + 1].node;
            if child.is_full() {
                let binode = BiNode::from_existing_and_new(bit, ChildPointer::node(child), new_leaf);
                self.integrate_binode(stack, depth + 1, binode);
            } else {
                let info = InsertInformation::whole_node(child.len(), bit);
                let replacement = Entries::from_node(child).add_entry(&info, new_leaf).allocate();
                self.replace_slot(stack, depth + 1, replacement);
                // SAFETY: `child` was just unlinked.
                unsafe { child.free() };
            }
        } else if !frame.node.is_full() {
            let replacement = entries.add_entry(&info, new_leaf).allocate();
            self.replace_slot(stack, depth, replacement);
            // SAFETY: the node was just unlinked.
            unsafe { frame.node.free() };
        } else if bit.absolute > frame.msb {
            let binode = entries.split(&info, new_leaf);
            trace!(depth, bit = binode.bit, height = binode.height, "split full node");
            self.integrate_binode(stack, depth, binode);
            // SAFETY: the split halves replaced the node.
            unsafe { frame.node.free() };
        } else {
            let binode = BiNode::from_existing_and_new(bit, ChildPointer::node(frame.node), new_leaf);
            self.integrate_binode(stack, depth, binode);
        }
    }

    /// Hangs `binode` where the entry at `depth` is, pulling it into the
    /// parent node when both have the same height.
    fn integrate_binode(&mut self, stack: &[InsertFrame], depth: usize, binode: BiNode) {
        if depth == 0 {
            trace!(bit = binode.bit, height = binode.height, "new root");
            self.root = binode.into_node();
            return;
        }

        let parent = stack[depth - 1];
        if parent.node.height() > binode.height {
            self.replace_slot(stack, depth, binode.into_node());
            return;
        }

        let mut entries = Entries::from_node(parent.node);
        entries.set_child(parent.index, binode.left);
        let info = entries.insert_information(parent.index, DiscriminativeBit::new(binode.bit, true));
        if parent.node.is_full() {
            let split = entries.split(&info, binode.right);
            trace!(depth = depth - 1, bit = split.bit, height = split.height, "split parent during pull-up");
            self.integrate_binode(stack, depth - 1, split);
        } else {
            let replacement = entries.add_entry(&info, binode.right).allocate();
            self.replace_slot(stack, depth - 1, replacement);
        }
        // SAFETY: the parent's slot now holds its replacement.
        unsafe { parent.node.free() };
    }

    /// Removes the value stored under `key`. Returns whether one was removed.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        match self.root.decode() {
            Child::Empty => false,
            Child::Leaf(id) => {
                if !keys_equal(self.key_of_id(id).as_ref(), key) {
                    return false;
                }
                self.root = ChildPointer::EMPTY;
                self.len -= 1;
                true
            }
            Child::Node(_) => {
                let (stack, id) = self.search_stack(key);
                if !keys_equal(self.key_of_id(id).as_ref(), key) {
                    return false;
                }
                self.remove_entry_at(&stack, stack.len() - 1, None);
                self.len -= 1;
                self.refresh_heights(key);
                true
            }
        }
    }

    /// Removes entry `stack[depth].index` from the node at `depth`, after first
    /// replacing entry `patch.0` with `patch.1`.
    fn remove_entry_at(&mut self, stack: &[InsertFrame], depth: usize, patch: Option<(usize, ChildPointer)>) {
        let frame = stack[depth];
        let mut current = Entries::from_node(frame.node);
        if let Some((index, replacement)) = patch {
            current.set_child(index, replacement);
        }
        let deletion = current.deletion_information(frame.index);

        if depth > 0 {
            let parent = stack[depth - 1];
            let parent_entries = Entries::from_node(parent.node);
            let parent_deletion = parent_entries.deletion_information(parent.index);
            if parent_deletion.has_direct_neighbour() {
                let neighbour = parent_entries.child(parent_deletion.direct_neighbour_index());
                let height = frame.node.height();
                match neighbour.as_node() {
                    Some(sibling)
                        if sibling.height() == height && sibling.len() + frame.node.len() - 1 <= MAX_ENTRIES =>
                    {
                        let remaining = current.remove_entry(&deletion);
                        let sibling_entries = Entries::from_node(sibling);
                        let bit = parent_deletion.binode.bit;
                        let merged = if parent_deletion.value {
                            Entries::merge(bit, &sibling_entries, &remaining)
                        } else {
                            Entries::merge(bit, &remaining, &sibling_entries)
                        };
                        trace!(depth, entries = merged.len(), "merged with sibling");
                        self.replace_in_parent(stack, depth - 1, &parent_deletion, merged.allocate());
                        // SAFETY: both nodes were replaced by the merged node.
                        unsafe {
                            frame.node.free();
                            sibling.free();
                        }
                        return;
                    }
                    _ if neighbour.height() < height => {
                        let bit = DiscriminativeBit::new(parent_deletion.binode.bit, !parent_deletion.value);
                        let replacement = current.remove_and_add_entry(&deletion, bit, neighbour).allocate();
                        trace!(depth, "absorbed shorter sibling");
                        self.replace_in_parent(stack, depth - 1, &parent_deletion, replacement);
                        // SAFETY: replaced together with the parent's BiNode.
                        unsafe { frame.node.free() };
                        return;
                    }
                    _ => {}
                }
            }
        }

        let replacement = current.remove_entry(&deletion).allocate();
        self.replace_slot(stack, depth, replacement);
        // SAFETY: the node was just unlinked.
        unsafe { frame.node.free() };
    }

    /// `replacement` takes over the parent BiNode at `parent_depth` that joined
    /// the removed path and its direct neighbour.
    fn replace_in_parent(
        &mut self,
        stack: &[InsertFrame],
        parent_depth: usize,
        parent_deletion: &DeletionInformation,
        replacement: ChildPointer,
    ) {
        let parent = stack[parent_depth];
        if parent.node.len() == 2 {
            self.replace_slot(stack, parent_depth, replacement);
            // SAFETY: the parent is fully replaced.
            unsafe { parent.node.free() };
        } else {
            let patch = (parent_deletion.direct_neighbour_index(), replacement);
            self.remove_entry_at(stack, parent_depth, Some(patch));
        }
    }

    /// Heights only shrink on delete, and only along the removed key's path.
    fn refresh_heights(&mut self, key: &[u8]) {
        let mut path: SmallVec<[NodePtr; 16]> = SmallVec::new();
        let mut current = self.root;
        while let Some(node) = current.as_node() {
            path.push(node);
            current = node.child(node.search_index(key));
        }
        for node in path.into_iter().rev() {
            let tallest = (0..node.len()).map(|i| node.child(i).height()).max().unwrap_or(0);
            // SAFETY: `&mut self` excludes every reader of the tree.
            unsafe { node.set_height(tallest + 1) };
        }
    }

    /// All values in ascending key order.
    pub fn iter(&self) -> Iter<'_, V, E> {
        Iter::new(self, Cursor::begin(self.root))
    }

    /// Yields the value stored under `key`, then continues in order.
    /// Empty when `key` is absent.
    pub fn find(&self, key: &[u8]) -> Iter<'_, V, E> {
        let cursor = Cursor::seek_exact(self.root, key, |id| keys_equal(self.key_of_id(id).as_ref(), key));
        Iter::new(self, cursor)
    }

    /// Starts at the first value whose key is `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> Iter<'_, V, E> {
        let cursor = Cursor::seek_bound(self.root, key, true, |id| mismatch(self.key_of_id(id).as_ref(), key));
        Iter::new(self, cursor)
    }

    /// Starts at the first value whose key is `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> Iter<'_, V, E> {
        let cursor = Cursor::seek_bound(self.root, key, false, |id| mismatch(self.key_of_id(id).as_ref(), key));
        Iter::new(self, cursor)
    }

    /// The value `n` positions after the first one whose key is `>= key`.
    pub fn scan(&self, key: &[u8], n: usize) -> Option<V> {
        self.lower_bound(key).nth(n)
    }

    /// Walks the whole tree and reports the first structural violation:
    /// malformed nodes, inexact heights, out-of-order or unreachable values,
    /// or a length that disagrees with the number of leaves.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let leaves = match self.root.decode() {
            Child::Empty => 0,
            Child::Leaf(_) => 1,
            Child::Node(node) => check_node(node)?,
        };
        if leaves != self.len {
            return Err(format!("{} leaves but len is {}", leaves, self.len));
        }

        let mut previous: Option<E::Key> = None;
        for value in self.iter() {
            let key = self.extractor.key_of(&value);
            if let Some(prev) = &previous {
                if prev.as_ref() >= key.as_ref() {
                    return Err(format!("keys out of order: {:?} then {:?}", prev.as_ref(), key.as_ref()));
                }
            }
            match self.lookup(key.as_ref()) {
                Some(found) if found.into_id() == value.into_id() => {}
                _ => return Err(format!("value {} is not reachable by its key", value.into_id())),
            }
            previous = Some(key);
        }
        Ok(())
    }
}

fn check_node(node: NodePtr) -> std::result::Result<usize, String> {
    Entries::from_node(node)
        .validate()
        .map_err(|e| format!("{:?}: {}", node, e))?;
    let mapping = node.mapping();
    if mapping.most_significant_bit() > mapping.least_significant_bit() {
        return Err(format!("{:?}: inverted bit range in mapping", node));
    }

    let mut leaves = 0;
    let mut tallest = 0;
    for i in 0..node.len() {
        let child = node.child(i);
        tallest = tallest.max(child.height());
        leaves += match child.decode() {
            Child::Empty => return Err(format!("{:?}: empty child slot {}", node, i)),
            Child::Leaf(_) => 1,
            Child::Node(c) => check_node(c)?,
        };
    }
    if node.height() != tallest + 1 {
        return Err(format!("{:?}: height {} but tallest child is {}", node, node.height(), tallest));
    }
    Ok(leaves)
}

impl<V, E> Drop for HotSingleThreaded<V, E> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out readers.
        unsafe { free_subtree(self.root) };
    }
}
