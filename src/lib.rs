//! # hot-rowex
//!
//! An ordered in-memory index built on the Height Optimized Trie (HOT), with a
//! concurrent variant synchronized by ROWEX (read-optimized write exclusion).
//!
//! Based on "HOT: A Height Optimized Trie Index for Main-Memory Database Systems"
//! (SIGMOD 2018, Binna et al.)
//!
//! Leaves store value identifiers only. Keys are derived from values through a
//! [`KeyExtractor`], compared bitwise in big-endian order with shorter keys
//! zero-padded.
//!
//! ## Example
//!
//! ```rust
//! use hot_rowex::{HotRowex, HotSingleThreaded, IdentityKey};
//!
//! let mut trie: HotSingleThreaded<u64, _> = HotSingleThreaded::new(IdentityKey::new());
//! for v in [5, 1, 9, 3] {
//!     trie.insert(v);
//! }
//! assert_eq!(trie.iter().collect::<Vec<_>>(), vec![1, 3, 5, 9]);
//! assert!(trie.remove(&9u64.to_be_bytes()));
//! assert_eq!(trie.lookup(&9u64.to_be_bytes()), None);
//!
//! let shared: HotRowex<u64, _> = HotRowex::new(IdentityKey::new());
//! std::thread::scope(|s| {
//!     for t in 0..4u64 {
//!         let shared = &shared;
//!         s.spawn(move || {
//!             for i in 0..100 {
//!                 shared.insert(i * 4 + t);
//!             }
//!         });
//!     }
//! });
//! assert_eq!(shared.iter().count(), 400);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

mod bits;
mod child;
mod config;
mod durable;
mod entries;
mod epoch;
mod error;
mod iter;
mod key;
mod mapping;
mod node;
mod rowex;
mod single_threaded;
mod stats;

pub use bits::{mismatch, DiscriminativeBit};
pub use child::MAX_VALUE_ID;
pub use config::Config;
#[cfg(target_arch = "x86_64")]
pub use durable::CacheLineFlush;
pub use durable::{DurablePublish, Volatile};
pub use error::{HotError, Result};
pub use iter::{Iter, RowexIter};
pub use key::{IdentityKey, IndexedBytes, KeyExtractor, ValueId, MAX_KEY_LEN};
pub use node::NodeKind;
pub use rowex::HotRowex;
pub use single_threaded::HotSingleThreaded;

#[cfg(test)]
mod proptests;
