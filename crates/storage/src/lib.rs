//! Shared segments for the Tessera object store
//!
//! This crate implements the shared-memory layout:
//! - [`Counters`]: the four shared allocation counters
//! - [`DataArena`]: the append-only word-addressed object region
//! - [`LocatorTable`] and per-transaction [`LocatorView`] overlays
//! - [`IdIndex`]: the additive id → locator hash index
//! - [`HandleTable`]: the process-wide resource table (the portable
//!   equivalent of the kernel fd table used for segment and log sharing)
//! - [`StackAllocator`] and the server-side [`MemoryManager`] region grants
//!
//! All structures are lock-free on their hot paths: ordering is obtained
//! through compare-exchange and acquire/release pairs on the shared counters
//! and slots, never through a global mutex.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod counters;
pub mod handles;
pub mod id_index;
pub mod locators;
pub mod memory_manager;
pub mod segments;
pub mod stack_allocator;

pub use arena::DataArena;
pub use counters::Counters;
pub use handles::{HandleTable, Resource};
pub use id_index::{HashNode, IdIndex, IndexEntry};
pub use locators::{LocatorTable, LocatorView};
pub use memory_manager::{MemoryManager, MemoryRange};
pub use segments::{DataSegment, SegmentGeometry};
pub use stack_allocator::{AllocationRecord, StackAllocator};
