#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A fixed-capacity table for the sentinel keys that a larger concurrent hash table cannot
//! store through its normal hashing path.
//!
//! Open-addressing hash tables commonly reserve a few key values as markers for empty, locked
//! or reclaimable buckets. Those keys can then not be inserted like any other key. This crate
//! provides [`ReservedTable`], a tiny side table that stores one vector of `dimension` values for
//! each reserved key, so the outer table can route them here and still offer the full key space
//! to its users.
//!
//! The reserved keys are [`EMPTY_KEY`], [`RECLAIM_KEY`], [`LOCKED_KEY`] and
//! [`RESERVED_KEY_MASK`]. They share every bit except the lowest two, which is what
//! [`is_reserved_key()`] checks.
//!
//! # Memory
//!
//! Each table occupies a single zero-filled block requested from an [`Allocator`] with a
//! [`MemoryKind`] hint. The default [`SystemAllocator`] serves every kind from the global heap.
//! Custom allocators can place the block in accelerator or pinned memory.
//!
//! # Concurrency
//!
//! Every operation except [`ReservedTable::clear()`] takes `&self` and locks only the slot it
//! touches, so any number of threads can use a table at once. The [`dispatch`] module runs
//! batches of operations on many execution contexts and collects their results in order.
//!
//! # Example
//!
//! ```
//! use reserved_bucket::{EMPTY_KEY, ReservedTable};
//!
//! let table = ReservedTable::<f32>::builder().dimension(10).build().unwrap();
//!
//! let ascending: Vec<f32> = (0..10).map(|i| i as f32).collect();
//!
//! table.write_vector(EMPTY_KEY, &ascending);
//! assert!(table.contains(EMPTY_KEY));
//!
//! table.erase(EMPTY_KEY);
//! assert!(!table.contains(EMPTY_KEY));
//!
//! table.accum_or_assign(EMPTY_KEY, false, &ascending);
//! table.accum_or_assign(EMPTY_KEY, true, &ascending);
//!
//! let mut out = [0.0; 10];
//! table.read_vector(EMPTY_KEY, &mut out);
//! assert_eq!(out, [0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0, 16.0, 18.0]);
//! ```

mod builder;
pub mod dispatch;
mod error;
mod keys;
mod layout;
mod memory;
mod slot_lock;
mod slot_vector;
mod table;
mod value;

pub use builder::*;
pub use error::*;
pub use keys::*;
pub(crate) use layout::*;
pub use memory::*;
pub(crate) use slot_lock::*;
pub use slot_vector::*;
pub use table::*;
pub use value::*;
