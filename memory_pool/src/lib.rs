//! Device-memory units and the pools that hand them out.
//!
//! A [`UnitPool`] carves bulk device allocations into fixed [`UNIT_SIZE`]
//! units; a [`StagingRing`] keeps pinned host buffers of the same size for
//! asynchronous uploads. Both talk to the hardware only through
//! [`DeviceBackend`].

pub mod device;
pub mod pool;
pub mod staging;
pub mod unit;

pub use device::{
    BackendError, Completion, DeviceBackend, DevicePtr, PinnedBuffer, SimConfig, SimDevice,
};
#[cfg(feature = "cuda")]
pub use device::CudaDevice;
pub use pool::{UnitId, UnitPool};
pub use staging::{StagingBuffer, StagingOrigin, StagingRing};
pub use unit::{read_block, Unit};

/// Size of one unit, and the block size negotiated with clients.
pub const UNIT_SIZE: usize = 64 * 1024;

/// Size of one bulk device allocation.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

pub const UNITS_PER_CHUNK: usize = CHUNK_SIZE / UNIT_SIZE;
