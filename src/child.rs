// =============================================================================
// Child pointers
// =============================================================================
//
// A child slot is a single `u64` so it can live in an `AtomicU64`:
// - `0`                      : empty (only ever seen at the root)
// - `(value_id << 1) | 1`    : leaf, carrying a 63-bit value id
// - anything else            : address of a node (8-byte aligned, low bit 0)

use crate::node::NodePtr;

/// Largest value id a leaf can carry.
pub const MAX_VALUE_ID: u64 = (1u64 << 63) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ChildPointer(u64);

/// Decoded view of a [`ChildPointer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Child {
    Empty,
    Leaf(u64),
    Node(NodePtr),
}

impl ChildPointer {
    pub(crate) const EMPTY: ChildPointer = ChildPointer(0);

    #[inline]
    pub(crate) fn leaf(value_id: u64) -> Self {
        debug_assert!(value_id <= MAX_VALUE_ID);
        Self((value_id << 1) | 1)
    }

    #[inline]
    pub(crate) fn node(node: NodePtr) -> Self {
        let raw = node.addr() as u64;
        debug_assert!(raw != 0 && raw & 1 == 0);
        Self(raw)
    }

    #[inline]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub(crate) fn is_leaf(self) -> bool {
        self.0 & 1 == 1
    }

    #[cfg(test)]
    pub(crate) fn is_node(self) -> bool {
        !self.is_empty() && !self.is_leaf()
    }

    #[inline]
    pub(crate) fn decode(self) -> Child {
        if self.is_empty() {
            Child::Empty
        } else if self.is_leaf() {
            Child::Leaf(self.0 >> 1)
        } else {
            // SAFETY: node pointers are only ever produced by `ChildPointer::node`.
            Child::Node(unsafe { NodePtr::from_addr(self.0 as usize) })
        }
    }

    #[inline]
    pub(crate) fn as_node(self) -> Option<NodePtr> {
        match self.decode() {
            Child::Node(n) => Some(n),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn leaf_id(self) -> Option<u64> {
        self.is_leaf().then_some(self.0 >> 1)
    }

    /// Leaves (and the empty pointer) have height 0.
    #[inline]
    pub(crate) fn height(self) -> u16 {
        self.as_node().map_or(0, |n| n.height())
    }
}

impl std::fmt::Debug for ChildPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.decode() {
            Child::Empty => f.write_str("Empty"),
            Child::Leaf(id) => write!(f, "Leaf({id})"),
            Child::Node(n) => write!(f, "Node({:#x})", n.addr()),
        }
    }
}
