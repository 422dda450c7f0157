//! Core memory and indexing engine for micro containers: a power-of-two
//! buddy allocator, a fixed-size node pool built on top of it, and a
//! PATRICIA radix tree with its own internal sub-allocator.
//!
//! Layered bottom to top: [`buddy`] owns every byte this crate ever asks
//! the OS for; [`node_pool`] carves fixed-size slots out of buddy blocks
//! for any fixed-size-object consumer; [`mini_buddy`] and [`radix`]
//! together give each radix tree its own small, single-threaded
//! allocator over node-pool-supplied blocks, so unrelated trees never
//! contend with each other or with the shared buddy lock.

pub mod align;
pub mod bitops;
pub mod buddy;
pub mod error;
pub mod mini_buddy;
pub mod node_pool;
pub mod radix;

pub use buddy::{AllocFlags, BuddyAllocator, BuddyConfig, BuddyStats};
pub use error::{BuddyError, PoolError, RadixError};
pub use node_pool::{Pool, PoolStats};
pub use radix::{sortint_key, MemoryMode, RadixTree};
