// =============================================================================
// Concurrent HOT (ROWEX: read-optimized write exclusion)
// =============================================================================
//
// Readers never lock and never restart. Writers lock only the nodes they
// replace or whose child slots they overwrite, always bottom-up, and never
// modify a published node's keys: every structural change allocates the
// replacement first and then publishes it with a single atomic store. A
// replaced node is marked obsolete under its lock and handed to the epoch
// reclaimer, so readers that still hold it keep a valid view.
//
// A writer first descends without locks, recording every slot it passes and
// the pointer it saw there. It then predicts how far up a split can travel
// (a full node whose parent is exactly one level taller), locks that chain,
// and checks that every recorded slot below the topmost lock still holds the
// pointer it saw. Any lock on an obsolete node or any changed slot restarts
// the insert from the root.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bits::{keys_equal, mismatch, DiscriminativeBit};
use crate::child::{Child, ChildPointer};
use crate::config::Config;
use crate::durable::{DurablePublish, Volatile};
use crate::entries::{BiNode, Entries, InsertInformation};
use crate::epoch::{EpochGuard, EpochReclaimer};
use crate::error::{check_entry, Result};
use crate::iter::{Cursor, RowexIter};
use crate::key::{KeyExtractor, ValueId};
use crate::node::{free_subtree, NodePtr};
use crate::stats;

/// A node unlinked from the tree, freed once no reader can still hold it.
struct RetiredNode(NodePtr);

// SAFETY: a retired node is unreachable; only the reclaimer touches it again.
unsafe impl Send for RetiredNode {}

impl Drop for RetiredNode {
    fn drop(&mut self) {
        // SAFETY: dropped by the reclaimer after every reader left.
        unsafe { self.0.free() };
    }
}

/// Where a pointer was read from.
#[derive(Clone, Copy, Debug)]
enum SlotRef {
    Root,
    Child(NodePtr, usize),
}

/// One step of the lock-free descent.
#[derive(Clone, Copy, Debug)]
struct Frame {
    slot: SlotRef,
    observed: ChildPointer,
    /// Entry of `observed` the descent continued with (nodes only).
    index: usize,
    /// `u16::MAX` for the leaf frame.
    msb: u16,
}

impl Frame {
    #[inline]
    fn node(&self) -> Option<NodePtr> {
        self.observed.as_node()
    }
}

type Frames = SmallVec<[Frame; 16]>;

/// Nodes locked by one insert attempt; unlocked on drop.
struct LockSet {
    nodes: SmallVec<[NodePtr; 8]>,
}

impl LockSet {
    fn new() -> Self {
        Self { nodes: SmallVec::new() }
    }

    fn lock(&mut self, node: NodePtr) -> bool {
        if node.try_lock() {
            self.nodes.push(node);
            true
        } else {
            false
        }
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        for node in self.nodes.drain(..) {
            node.unlock();
        }
    }
}

enum Attempt {
    Inserted,
    Existing(u64),
    Restart,
}

/// Concurrent ordered index: lock-free lookups and scans, fine-grained
/// locking for inserts. No removal.
///
/// `D` decides what happens when nodes and child slots are published; see
/// [`DurablePublish`].
pub struct HotRowex<V, E, D = Volatile> {
    root: AtomicU64,
    extractor: E,
    durable: D,
    config: Config,
    reclaimer: EpochReclaimer<RetiredNode>,
    _values: PhantomData<fn() -> V>,
}

impl<V, E> HotRowex<V, E, Volatile> {
    pub fn new(extractor: E) -> Self {
        Self::build(extractor, Config::default(), Volatile)
    }

    pub fn with_config(extractor: E, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(extractor, config, Volatile))
    }
}

impl<V, E, D> HotRowex<V, E, D> {
    fn build(extractor: E, config: Config, durable: D) -> Self {
        Self {
            root: AtomicU64::new(ChildPointer::EMPTY.raw()),
            extractor,
            durable,
            reclaimer: EpochReclaimer::new(config.epoch_advance_threshold),
            config,
            _values: PhantomData,
        }
    }

    /// Like [`with_config`](HotRowex::with_config), publishing through `durable`.
    pub fn with_durability(extractor: E, config: Config, durable: D) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(extractor, config, durable))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    #[inline]
    fn load_root(&self) -> ChildPointer {
        ChildPointer::from_raw(self.root.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.load_root().is_empty()
    }
}

impl<V, E, D> HotRowex<V, E, D>
where
    V: ValueId,
    E: KeyExtractor<V>,
    D: DurablePublish,
{
    #[inline]
    pub(crate) fn key_of_id(&self, id: u64) -> E::Key {
        self.extractor.key_of(&V::from_id(id))
    }

    fn pin(&self) -> EpochGuard<'_, RetiredNode> {
        self.reclaimer.pin()
    }

    /// Nodes on the longest root-to-leaf path.
    pub fn height(&self) -> usize {
        let _guard = self.pin();
        usize::from(self.load_root().height())
    }

    pub fn lookup(&self, key: &[u8]) -> Option<V> {
        let _guard = self.pin();
        let mut current = self.load_root();
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

    /// Memory held by nodes and the statistics counters. Concurrent inserts
    /// may or may not be reflected.
    pub fn statistics(&self) -> (usize, BTreeMap<String, f64>) {
        let _guard = self.pin();
        stats::collect(self.load_root())
    }

    // =========================================================================
    // Publication
    // =========================================================================

    #[inline]
    fn load_slot(&self, slot: SlotRef) -> ChildPointer {
        match slot {
            SlotRef::Root => self.load_root(),
            SlotRef::Child(node, index) => node.child(index),
        }
    }

    /// Caller holds the lock of the node owning `slot` (of the root node for `Root`).
    fn store_slot(&self, slot: SlotRef, value: ChildPointer) {
        match slot {
            SlotRef::Root => {
                self.root.store(value.raw(), Ordering::Release);
                self.durable.publish(&self.root);
            }
            SlotRef::Child(node, index) => {
                node.store_child(index, value);
                self.durable.publish(&node.child_slots()[index]);
            }
        }
    }

    /// Makes a freshly built node durable before anyone can reach it.
    fn persist(&self, pointer: ChildPointer) -> ChildPointer {
        if let Some(node) = pointer.as_node() {
            let (start, len) = node.memory();
            self.durable.persist_node(start, len);
        }
        pointer
    }

    fn persist_binode(&self, binode: &BiNode) {
        self.persist(binode.left);
        self.persist(binode.right);
    }

    fn cas_root(&self, current: ChildPointer, new: ChildPointer) -> bool {
        let swapped = self
            .root
            .compare_exchange(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.durable.publish(&self.root);
        }
        swapped
    }

    fn retire(&self, guard: &EpochGuard<'_, RetiredNode>, node: NodePtr) {
        node.mark_obsolete();
        guard.retire(RetiredNode(node));
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts `value` unless a value with the same key exists. Returns whether it was inserted.
    ///
    /// Values with an over-long key or an out-of-range id are not stored and
    /// `false` is returned; [`try_insert`](Self::try_insert) reports why.
    pub fn insert(&self, value: V) -> bool {
        matches!(self.put(value, false), Ok(Attempt::Inserted))
    }

    pub fn try_insert(&self, value: V) -> Result<bool> {
        self.put(value, false).map(|done| matches!(done, Attempt::Inserted))
    }

    /// Inserts `value`, replacing the value with the same key. Returns the replaced value.
    ///
    /// Values [`insert`](Self::insert) would reject leave the trie unchanged and return `None`.
    pub fn upsert(&self, value: V) -> Option<V> {
        self.try_upsert(value).ok().flatten()
    }

    pub fn try_upsert(&self, value: V) -> Result<Option<V>> {
        match self.put(value, true)? {
            Attempt::Existing(id) => Ok(Some(V::from_id(id))),
            _ => Ok(None),
        }
    }

    /// Never returns [`Attempt::Restart`].
    fn put(&self, value: V, replace: bool) -> Result<Attempt> {
        let key_holder = self.extractor.key_of(&value);
        let key = key_holder.as_ref();
        let id = value.into_id();
        check_entry(key, id)?;
        let new_leaf = ChildPointer::leaf(id);
        let guard = self.pin();
        let mut restarts = 0usize;
        loop {
            match self.try_put(&guard, key, new_leaf, replace) {
                Attempt::Restart => {
                    restarts += 1;
                    debug!(restarts, "insert restarted");
                }
                done => return Ok(done),
            }
        }
    }

    fn try_put(
        &self,
        guard: &EpochGuard<'_, RetiredNode>,
        key: &[u8],
        new_leaf: ChildPointer,
        replace: bool,
    ) -> Attempt {
        let root = self.load_root();
        match root.decode() {
            Child::Empty => {
                if self.cas_root(root, new_leaf) {
                    Attempt::Inserted
                } else {
                    Attempt::Restart
                }
            }
            Child::Leaf(existing) => match mismatch(self.key_of_id(existing).as_ref(), key) {
                None => {
                    if replace && !self.cas_root(root, new_leaf) {
                        return Attempt::Restart;
                    }
                    Attempt::Existing(existing)
                }
                Some(bit) => {
                    let node = self.persist(BiNode::from_existing_and_new(bit, root, new_leaf).into_node());
                    if self.cas_root(root, node) {
                        return Attempt::Inserted;
                    }
                    if let Some(unpublished) = node.as_node() {
                        // SAFETY: the CAS failed, so no other thread ever saw it.
                        unsafe { unpublished.free() };
                    }
                    Attempt::Restart
                }
            },
            Child::Node(_) => {
                let Some((frames, existing)) = self.descend(root, key) else {
                    return Attempt::Restart;
                };
                match mismatch(self.key_of_id(existing).as_ref(), key) {
                    None if replace => self.replace_leaf(&frames, existing, new_leaf),
                    None => Attempt::Existing(existing),
                    Some(bit) => self.insert_new(guard, &frames, bit, new_leaf),
                }
            }
        }
    }

    /// Lock-free descent recording every slot; the last frame is the leaf.
    fn descend(&self, root: ChildPointer, key: &[u8]) -> Option<(Frames, u64)> {
        let mut frames = Frames::new();
        let mut slot = SlotRef::Root;
        let mut current = root;
        loop {
            match current.decode() {
                Child::Node(node) => {
                    let index = node.search_index(key);
                    frames.push(Frame {
                        slot,
                        observed: current,
                        index,
                        msb: node.most_significant_bit(),
                    });
                    slot = SlotRef::Child(node, index);
                    current = node.child(index);
                }
                Child::Leaf(id) => {
                    frames.push(Frame {
                        slot,
                        observed: current,
                        index: 0,
                        msb: u16::MAX,
                    });
                    return Some((frames, id));
                }
                Child::Empty => return None,
            }
        }
    }

    /// Swaps the leaf of an existing key for `new_leaf` under the lock of the
    /// node holding it.
    fn replace_leaf(&self, frames: &[Frame], existing: u64, new_leaf: ChildPointer) -> Attempt {
        let leaf = frames[frames.len() - 1];
        let Some(holder) = frames[frames.len() - 2].node() else {
            return Attempt::Restart;
        };
        let mut locks = LockSet::new();
        if !locks.lock(holder) || self.load_slot(leaf.slot) != leaf.observed {
            return Attempt::Restart;
        }
        self.store_slot(leaf.slot, new_leaf);
        Attempt::Existing(existing)
    }

    fn insert_new(
        &self,
        guard: &EpochGuard<'_, RetiredNode>,
        frames: &[Frame],
        bit: DiscriminativeBit,
        new_leaf: ChildPointer,
    ) -> Attempt {
        let leaf_index = frames.len() - 1;
        let mut depth = 0;
        while depth + 1 < leaf_index && bit.absolute > frames[depth + 1].msb {
            depth += 1;
        }
        let Some(node) = frames[depth].node() else {
            return Attempt::Restart;
        };
        let info = Entries::from_node(node).insert_information(frames[depth].index, bit);
        let single = info.count == 1;
        let at_leaf = depth + 1 == leaf_index;

        // The node that changes, and how the new entry enters it.
        let (first, info) = match frames[depth + 1].node() {
            Some(child) if single && !at_leaf => (depth + 1, InsertInformation::whole_node(child.len(), bit)),
            _ => (depth, info),
        };
        let pushdown = single && at_leaf && node.height() > 1;

        let mut locks = LockSet::new();
        let Some(top) = self.lock_chain(frames, first, pushdown, &mut locks) else {
            debug!(depth = first, "lock on obsolete node");
            return Attempt::Restart;
        };
        // Every slot written or routed through must still hold what the descent
        // saw. The root slot only changes under the root node's lock.
        let from = if top == 0 { 0 } else { top + 1 };
        let unchanged = (from..=first + 1).all(|i| self.load_slot(frames[i].slot) == frames[i].observed);
        if !unchanged {
            debug!(depth = first, top, "slot changed during descent");
            return Attempt::Restart;
        }

        if pushdown {
            let leaf = frames[leaf_index];
            let binode = BiNode::from_existing_and_new(bit, leaf.observed, new_leaf);
            self.store_slot(leaf.slot, self.persist(binode.into_node()));
            return Attempt::Inserted;
        }

        let Some(target) = frames[first].node() else {
            return Attempt::Restart;
        };
        let entries = Entries::from_node(target);
        if !target.is_full() {
            let replacement = self.persist(entries.add_entry(&info, new_leaf).allocate());
            self.store_slot(frames[first].slot, replacement);
            self.retire(guard, target);
            return Attempt::Inserted;
        }

        let binode = if bit.absolute > target.most_significant_bit() {
            let binode = entries.split(&info, new_leaf);
            self.persist_binode(&binode);
            self.retire(guard, target);
            trace!(depth = first, bit = binode.bit, height = binode.height, "split full node");
            binode
        } else {
            BiNode::from_existing_and_new(bit, ChildPointer::node(target), new_leaf)
        };
        self.integrate_binode(guard, frames, first, binode);
        Attempt::Inserted
    }

    /// Locks every node the insert at `first` may replace or write into, bottom-up.
    /// Returns the topmost locked depth, or `None` if a node turned obsolete.
    fn lock_chain(&self, frames: &[Frame], first: usize, pushdown: bool, locks: &mut LockSet) -> Option<usize> {
        let node_at = |depth: usize| frames[depth].node();
        if !locks.lock(node_at(first)?) {
            return None;
        }
        if pushdown || first == 0 {
            return Some(first);
        }
        if !locks.lock(node_at(first - 1)?) {
            return None;
        }
        let mut top = first - 1;

        // A full node one level below its parent may push a BiNode into the
        // parent, which then needs its own slot locked.
        let mut level = first;
        while level > 0 {
            let current = node_at(level)?;
            let parent = node_at(level - 1)?;
            if !current.is_full() || current.height() + 1 != parent.height() {
                break;
            }
            if level - 1 > 0 {
                if !locks.lock(node_at(level - 2)?) {
                    return None;
                }
                top = level - 2;
            }
            level -= 1;
        }
        Some(top)
    }

    /// Hangs `binode` where the node at `depth` is, pulling it into locked
    /// ancestors of equal height.
    fn integrate_binode(
        &self,
        guard: &EpochGuard<'_, RetiredNode>,
        frames: &[Frame],
        mut depth: usize,
        mut binode: BiNode,
    ) {
        loop {
            if depth == 0 {
                trace!(bit = binode.bit, height = binode.height, "new root");
                self.store_slot(SlotRef::Root, self.persist(binode.into_node()));
                return;
            }
            let parent_frame = frames[depth - 1];
            let Some(parent) = parent_frame.node() else {
                return;
            };
            if parent.height() > binode.height {
                self.store_slot(frames[depth].slot, self.persist(binode.into_node()));
                return;
            }

            let mut entries = Entries::from_node(parent);
            entries.set_child(parent_frame.index, binode.left);
            let info = entries.insert_information(parent_frame.index, DiscriminativeBit::new(binode.bit, true));
            if !parent.is_full() {
                let replacement = self.persist(entries.add_entry(&info, binode.right).allocate());
                self.store_slot(parent_frame.slot, replacement);
                self.retire(guard, parent);
                return;
            }
            binode = entries.split(&info, binode.right);
            self.persist_binode(&binode);
            self.retire(guard, parent);
            trace!(depth = depth - 1, bit = binode.bit, height = binode.height, "split parent during pull-up");
            depth -= 1;
        }
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    fn start_iter(&self, seek: impl FnOnce(ChildPointer) -> Cursor) -> RowexIter<'_, V, E, D> {
        let capacity = self.config.iterator_buffer_size;
        let mut buffer = Vec::with_capacity(capacity);
        {
            let _guard = self.pin();
            seek(self.load_root()).fill(&mut buffer, capacity);
        }
        RowexIter::new(self, buffer)
    }

    /// Appends the values following `key` (exclusive) to `out`, up to one buffer.
    pub(crate) fn fill_after(&self, key: &[u8], out: &mut Vec<u64>) {
        let _guard = self.pin();
        let mut cursor = Cursor::seek_bound(self.load_root(), key, false, |id| {
            mismatch(self.key_of_id(id).as_ref(), key)
        });
        cursor.fill(out, self.config.iterator_buffer_size);
    }

    /// All values in ascending key order.
    pub fn iter(&self) -> RowexIter<'_, V, E, D> {
        self.start_iter(Cursor::begin)
    }

    /// Yields the value stored under `key`, then continues in order.
    /// Empty when `key` is absent.
    pub fn find(&self, key: &[u8]) -> RowexIter<'_, V, E, D> {
        self.start_iter(|root| Cursor::seek_exact(root, key, |id| keys_equal(self.key_of_id(id).as_ref(), key)))
    }

    /// Starts at the first value whose key is `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> RowexIter<'_, V, E, D> {
        self.start_iter(|root| Cursor::seek_bound(root, key, true, |id| mismatch(self.key_of_id(id).as_ref(), key)))
    }

    /// Starts at the first value whose key is `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> RowexIter<'_, V, E, D> {
        self.start_iter(|root| Cursor::seek_bound(root, key, false, |id| mismatch(self.key_of_id(id).as_ref(), key)))
    }

    /// The value `n` positions after the first one whose key is `>= key`.
    pub fn scan(&self, key: &[u8], n: usize) -> Option<V> {
        self.lower_bound(key).nth(n)
    }
}

impl<V, E, D> Drop for HotRowex<V, E, D> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out readers; retired nodes are not part of
        // the tree and are freed when the reclaimer drops.
        unsafe { free_subtree(ChildPointer::from_raw(*self.root.get_mut())) };
    }
}
