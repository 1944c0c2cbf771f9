//! Concurrent chained hash table for caller-hashed values: lock-free reads, per-bucket write
//! locks, and globally-serialized, interruptible resizing.
//!
//! # [`ChainTable`]
//!
//! [`ChainTable`] is keyed by a caller-supplied 64-bit hash and an equality predicate, stores
//! values in per-bucket chains, and reclaims memory through epochs, so readers are never blocked
//! and never read freed memory.
//!
//! ```
//! use chaintable::ChainTable;
//!
//! let table: ChainTable<(u64, &str)> = ChainTable::new();
//!
//! assert!(table.insert(3, |v| v.0 == 3, (3, "three")));
//! assert_eq!(table.get(3, |v| v.0 == 3), Some((3, "three")));
//!
//! assert!(table.grow(10));
//! assert_eq!(table.get(3, |v| v.0 == 3), Some((3, "three")));
//! ```
//!
//! # [`GrowTask`] and [`BulkDeleteTask`]
//!
//! Structural work can be split into claimable bucket ranges, driven by several cooperating
//! threads, and paused mid-flight, for hosts that must periodically stop the world.

#![warn(missing_docs)]

mod chain_table;
pub use chain_table::{BulkDeleteTask, ChainTable, GrowTask, Statistics};

mod exit_guard;

#[cfg(feature = "serde")]
mod serde;

pub use sdd::Guard;
