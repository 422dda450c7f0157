//! Unified error types, one per subsystem.
//!
//! Follows the teacher's `mm::error` shape: a plain enum with a hand-written
//! `Display` impl rather than a derive-macro error crate, because the
//! variant set here is small and the messages benefit from bespoke
//! wording. Unlike the teacher (`no_std`), this crate is hosted, so each
//! enum also implements `std::error::Error`.
//!
//! Recoverable conditions (capacity exceeded, lookup miss) are represented
//! on the public API as `Option`/sentinel returns, per the propagation
//! policy in the spec — these enums only cover OS-interface failures and
//! programmer errors that the `debug-tracker` feature chooses to report
//! instead of silently invoking undefined behavior.

use core::fmt;

/// Errors surfaced by [`crate::buddy::BuddyAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuddyError {
    /// The OS refused to hand back a new superblock (mmap/posix_memalign
    /// failed) and the allocator was configured not to abort.
    OutOfMemory,
    /// Requested size rounds to an exponent above `MAX_P2`.
    RequestTooLarge { requested: usize, max: usize },
    /// `debug-tracker` detected a double-free or a free with a size that
    /// does not match the matching allocation.
    InvalidFree { address: usize },
}

impl fmt::Display for BuddyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "buddy allocator: OS allocation failed"),
            Self::RequestTooLarge { requested, max } => write!(
                f,
                "buddy allocator: request for {requested} bytes exceeds max block size {max}"
            ),
            Self::InvalidFree { address } => write!(
                f,
                "buddy allocator: invalid free at {address:#x} (double-free or size mismatch)"
            ),
        }
    }
}

impl std::error::Error for BuddyError {}

/// Errors surfaced by [`crate::node_pool::Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Backing buddy allocator could not supply a new block.
    OutOfMemory,
    /// `node_size` was smaller than a machine word, or `block_size` was
    /// not a power of two in the buddy allocator's supported range.
    InvalidConfig,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "node pool: backing buddy allocator is exhausted"),
            Self::InvalidConfig => write!(f, "node pool: invalid node_size/block_size"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Errors surfaced by [`crate::radix::RadixTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadixError {
    /// Node allocation failed (the internal mini-buddy's backing node
    /// pool is exhausted).
    OutOfMemory,
}

impl fmt::Display for RadixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "radix tree: node allocation failed"),
        }
    }
}

impl std::error::Error for RadixError {}
