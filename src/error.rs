//! Error types for rdma-epoch.
//!
//! Setup, registry and buffer-carving failures surface as [`Error`].
//! Optimistic conflicts are not errors in that sense: they are reported as
//! `false` from the latch, or as a [`Restart`] value carrying the version that
//! was observed, and the caller restarts its whole operation.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The epoch manager has not been initialized, or was uninitialized.
    #[error("epoch manager is not initialized")]
    NotInitialized,
    /// The registry capacity must be a power of two so probing can mask.
    #[error("epoch table size {size} is not a power of two")]
    TableSizeNotPowerOfTwo { size: usize },
    /// The backing allocation for a table or region could not be obtained.
    #[error("failed to allocate {bytes} bytes")]
    AllocationFailed { bytes: usize },
    /// Every registry entry is owned and none could be recycled.
    #[error("epoch table exhausted: all {capacity} entries are owned")]
    RegistryExhausted { capacity: usize },
    /// The calling thread's local registrations are already being torn down.
    #[error("thread-local epoch registration is unavailable during thread exit")]
    ThreadExiting,
    /// A buffer layout parameter is unusable.
    #[error("invalid buffer configuration: {0}")]
    InvalidBufferConfig(String),
    /// A sub-region does not fit in the registered region.
    #[error("sub-region at offset {offset} with length {len} exceeds region of {region_len} bytes")]
    RegionOutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },
    /// A sub-region offset is not a multiple of its slot size.
    #[error("offset {offset} is not aligned to {align} bytes")]
    Misaligned { offset: usize, align: usize },
    /// OS error while mapping pinned memory.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Signal that an optimistic read observed a write-locked version.
///
/// The observed raw version is kept so callers can log or compare it, but the
/// only correct reaction is to restart the surrounding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("version latch is write-locked (observed version {observed})")]
pub struct Restart {
    pub observed: u64,
}
