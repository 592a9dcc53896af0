// =============================================================================
// Ordered iteration
// =============================================================================
//
// A `Cursor` is a depth-first walk over the trie driven by a small state
// machine:
//
//   Descend : push the first entry of the node on top of the stack
//   Store   : emit the leaf on top of the stack
//   Advance : move the top frame to its next entry
//   Ascend  : pop a finished frame
//   End     : nothing left
//
// The single-threaded iterator keeps its cursor between calls. The concurrent
// iterator fills a buffer of value ids under an epoch guard and, once the buffer
// is consumed, re-seeks an upper bound of the last emitted key, so it never
// holds node pointers across guards.

use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::bits::DiscriminativeBit;
use crate::child::{Child, ChildPointer};
use crate::durable::DurablePublish;
use crate::entries::Entries;
use crate::key::{KeyExtractor, ValueId};
use crate::node::NodePtr;
use crate::rowex::HotRowex;
use crate::single_threaded::HotSingleThreaded;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FillState {
    Descend,
    Store,
    Advance,
    Ascend,
    End,
}

/// One level of the walk: `current` is entry `index` of `node` (or the root).
#[derive(Clone, Copy, Debug)]
struct Frame {
    node: Option<NodePtr>,
    index: usize,
    end: usize,
    current: ChildPointer,
}

impl Frame {
    fn root(root: ChildPointer) -> Self {
        Self {
            node: None,
            index: 0,
            end: 1,
            current: root,
        }
    }

    fn entry(node: NodePtr, index: usize) -> Self {
        Self {
            node: Some(node),
            index,
            end: node.len(),
            current: node.child(index),
        }
    }
}

#[inline]
fn descend_or_store(current: ChildPointer) -> FillState {
    if current.is_leaf() {
        FillState::Store
    } else {
        FillState::Descend
    }
}

#[inline]
fn ascend_or_advance(frame: &Frame) -> FillState {
    if frame.index + 1 == frame.end {
        FillState::Ascend
    } else {
        FillState::Advance
    }
}

pub(crate) struct Cursor {
    stack: SmallVec<[Frame; 16]>,
    state: FillState,
}

impl Cursor {
    fn exhausted() -> Self {
        Self {
            stack: SmallVec::new(),
            state: FillState::End,
        }
    }

    /// Positioned before the smallest leaf.
    pub(crate) fn begin(root: ChildPointer) -> Self {
        if root.is_empty() {
            return Self::exhausted();
        }
        let mut stack = SmallVec::new();
        stack.push(Frame::root(root));
        Self {
            stack,
            state: descend_or_store(root),
        }
    }

    /// Follows `key` down to the leaf it routes to. Returns `None` for an empty trie.
    fn descend(root: ChildPointer, key: &[u8]) -> Option<(Self, u64)> {
        if root.is_empty() {
            return None;
        }
        let mut cursor = Self::begin(root);
        loop {
            let top = *cursor.stack.last()?;
            match top.current.decode() {
                Child::Node(node) => cursor.stack.push(Frame::entry(node, node.search_index(key))),
                Child::Leaf(id) => return Some((cursor, id)),
                Child::Empty => return None,
            }
        }
    }

    /// Positioned on the leaf `key` routes to, if `is_match` accepts it.
    pub(crate) fn seek_exact(root: ChildPointer, key: &[u8], is_match: impl FnOnce(u64) -> bool) -> Self {
        match Self::descend(root, key) {
            Some((mut cursor, id)) if is_match(id) => {
                cursor.state = FillState::Store;
                cursor
            }
            _ => Self::exhausted(),
        }
    }

    /// Positioned on the first leaf whose key is `>= key` (`inclusive`) or `> key`.
    ///
    /// `mismatch_with(id)` compares the key of leaf `id` against `key`.
    pub(crate) fn seek_bound(
        root: ChildPointer,
        key: &[u8],
        inclusive: bool,
        mismatch_with: impl FnOnce(u64) -> Option<DiscriminativeBit>,
    ) -> Self {
        let Some((mut cursor, id)) = Self::descend(root, key) else {
            return Self::exhausted();
        };
        let leaf_depth = cursor.stack.len() - 1;

        let Some(bit) = mismatch_with(id) else {
            cursor.state = if inclusive {
                FillState::Store
            } else {
                ascend_or_advance(&cursor.stack[leaf_depth])
            };
            return cursor;
        };

        if leaf_depth == 0 {
            // Root leaf: the search key is larger iff it has the 1 bit.
            if bit.value {
                return Self::exhausted();
            }
            cursor.state = FillState::Store;
            return cursor;
        }

        // Climb to the node whose BiNode structure the search key leaves.
        let mut depth = leaf_depth - 1;
        while depth > 0 {
            let msb = cursor.stack[depth].current.as_node().map_or(0, |n| n.most_significant_bit());
            if bit.absolute >= msb {
                break;
            }
            depth -= 1;
        }
        let Some(node) = cursor.stack[depth].current.as_node() else {
            return Self::exhausted();
        };
        let entry_index = cursor.stack[depth + 1].index;
        cursor.stack.truncate(depth + 1);

        let info = Entries::from_node(node).insert_information(entry_index, bit);
        let next = if bit.value {
            info.first + info.count
        } else {
            info.first
        };
        if next >= node.len() {
            cursor.state = ascend_or_advance(&cursor.stack[depth]);
        } else {
            let frame = Frame::entry(node, next);
            cursor.state = descend_or_store(frame.current);
            cursor.stack.push(frame);
        }
        cursor
    }

    /// Runs the walk until the next leaf is emitted.
    pub(crate) fn next_leaf(&mut self) -> Option<u64> {
        loop {
            match self.state {
                FillState::End => return None,
                FillState::Descend => {
                    let top = *self.stack.last()?;
                    let Some(node) = top.current.as_node() else {
                        self.state = FillState::End;
                        continue;
                    };
                    let frame = Frame::entry(node, 0);
                    self.state = descend_or_store(frame.current);
                    self.stack.push(frame);
                }
                FillState::Store => {
                    let top = *self.stack.last()?;
                    self.state = ascend_or_advance(&top);
                    if let Some(id) = top.current.leaf_id() {
                        return Some(id);
                    }
                }
                FillState::Advance => {
                    let top = self.stack.last_mut()?;
                    let Some(node) = top.node else {
                        self.state = FillState::End;
                        continue;
                    };
                    top.index += 1;
                    top.current = node.child(top.index);
                    self.state = descend_or_store(top.current);
                }
                FillState::Ascend => {
                    self.stack.pop();
                    self.state = match self.stack.last() {
                        Some(top) => ascend_or_advance(top),
                        None => FillState::End,
                    };
                }
            }
        }
    }

    /// Appends up to `capacity - out.len()` leaves to `out`.
    pub(crate) fn fill(&mut self, out: &mut Vec<u64>, capacity: usize) {
        while out.len() < capacity {
            match self.next_leaf() {
                Some(id) => out.push(id),
                None => break,
            }
        }
    }
}

// =============================================================================
// Single-threaded iterator
// =============================================================================

/// Ascending iterator over a [`HotSingleThreaded`].
pub struct Iter<'a, V, E> {
    cursor: Cursor,
    _trie: PhantomData<&'a HotSingleThreaded<V, E>>,
}

impl<'a, V, E> Iter<'a, V, E> {
    pub(crate) fn new(_trie: &'a HotSingleThreaded<V, E>, cursor: Cursor) -> Self {
        Self {
            cursor,
            _trie: PhantomData,
        }
    }
}

impl<V: ValueId, E> Iterator for Iter<'_, V, E> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        self.cursor.next_leaf().map(V::from_id)
    }
}

// =============================================================================
// Concurrent iterator
// =============================================================================

/// Ascending, buffered iterator over a [`HotRowex`].
///
/// Each refill observes a consistent snapshot of the part of the trie it walks,
/// but values inserted concurrently may or may not be seen.
pub struct RowexIter<'a, V, E, D>
where
    V: ValueId,
    E: KeyExtractor<V>,
    D: DurablePublish,
{
    trie: &'a HotRowex<V, E, D>,
    buffer: Vec<u64>,
    pos: usize,
    end_reached: bool,
}

impl<'a, V, E, D> RowexIter<'a, V, E, D>
where
    V: ValueId,
    E: KeyExtractor<V>,
    D: DurablePublish,
{
    /// `buffer` holds the first batch, filled under an epoch guard.
    pub(crate) fn new(trie: &'a HotRowex<V, E, D>, buffer: Vec<u64>) -> Self {
        Self {
            trie,
            end_reached: buffer.len() < trie.config().iterator_buffer_size,
            buffer,
            pos: 0,
        }
    }

    fn refill(&mut self) {
        let Some(&last) = self.buffer.last() else {
            self.end_reached = true;
            return;
        };
        let last_key = self.trie.key_of_id(last);
        self.buffer.clear();
        self.pos = 0;
        self.trie.fill_after(last_key.as_ref(), &mut self.buffer);
        self.end_reached = self.buffer.len() < self.trie.config().iterator_buffer_size;
    }
}

impl<V, E, D> Iterator for RowexIter<'_, V, E, D>
where
    V: ValueId,
    E: KeyExtractor<V>,
    D: DurablePublish,
{
    type Item = V;

    fn next(&mut self) -> Option<V> {
        if self.pos == self.buffer.len() {
            if self.end_reached {
                return None;
            }
            self.refill();
        }
        let id = *self.buffer.get(self.pos)?;
        self.pos += 1;
        Some(V::from_id(id))
    }
}
