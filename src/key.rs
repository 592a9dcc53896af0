//! Mapping stored values to their keys.
//!
//! The trie stores only value identifiers in its leaves. Keys are recovered on
//! demand through a [`KeyExtractor`], so a value must determine its key.

use std::marker::PhantomData;

/// Longest key (in bytes) the trie distinguishes.
pub const MAX_KEY_LEN: usize = 256;

/// A value that round-trips through a 63-bit leaf identifier.
///
/// Ids above [`MAX_VALUE_ID`](crate::MAX_VALUE_ID) are rejected on insert.
pub trait ValueId: Copy {
    fn into_id(self) -> u64;
    fn from_id(id: u64) -> Self;
}

macro_rules! impl_value_id {
    ($($t:ty),*) => {
        $(
            impl ValueId for $t {
                #[inline]
                fn into_id(self) -> u64 {
                    self as u64
                }

                #[inline]
                fn from_id(id: u64) -> Self {
                    id as $t
                }
            }
        )*
    };
}

impl_value_id!(u8, u16, u32, u64, usize);

/// Derives the key bytes of a stored value.
pub trait KeyExtractor<V> {
    type Key: AsRef<[u8]>;

    fn key_of(&self, value: &V) -> Self::Key;
}

/// An unsigned integer is its own key, in big-endian byte order.
///
/// The value doubles as its leaf id, so `u64` and `usize` values above
/// [`MAX_VALUE_ID`](crate::MAX_VALUE_ID) (top bit set) cannot be stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKey<V>(PhantomData<fn() -> V>);

impl<V> IdentityKey<V> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

macro_rules! impl_identity_key {
    ($($t:ty),*) => {
        $(
            impl KeyExtractor<$t> for IdentityKey<$t> {
                type Key = [u8; std::mem::size_of::<$t>()];

                #[inline]
                fn key_of(&self, value: &$t) -> Self::Key {
                    value.to_be_bytes()
                }
            }
        )*
    };
}

impl_identity_key!(u8, u16, u32, u64, usize);

/// The value is an index into a caller-owned table of byte-string keys.
///
/// The table must not change while a trie refers to it; indexes past its end
/// read as the empty key.
#[derive(Debug, Clone, Copy)]
pub struct IndexedBytes<'a> {
    table: &'a [Vec<u8>],
}

impl<'a> IndexedBytes<'a> {
    pub fn new(table: &'a [Vec<u8>]) -> Self {
        Self { table }
    }
}

impl<'a> KeyExtractor<usize> for IndexedBytes<'a> {
    type Key = &'a [u8];

    #[inline]
    fn key_of(&self, value: &usize) -> &'a [u8] {
        self.table.get(*value).map_or(&[], |k| k.as_slice())
    }
}
