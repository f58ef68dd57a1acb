//! The capability interface between the pools and a concrete device.
//!
//! Everything above this module works on [`DevicePtr`] addresses and
//! [`PinnedBuffer`] host staging memory; which hardware (if any) sits behind
//! them is decided when a backend is constructed.

use std::ptr::NonNull;

use vram_cuda_api::error::CudaError;

mod sim;
pub use sim::{SimConfig, SimDevice};

#[cfg(feature = "cuda")]
mod cuda;
#[cfg(feature = "cuda")]
pub use cuda::CudaDevice;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("device backend unavailable: {0}")]
    Unavailable(String),
    #[error("device out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },
    #[error("pinned host allocation of {bytes} bytes failed")]
    PinnedAlloc { bytes: usize },
    #[error("range {offset}+{len} is outside a {limit} byte region")]
    OutOfBounds {
        offset: usize,
        len: usize,
        limit: usize,
    },
    #[error("invalid device address {addr:#x}+{len}")]
    InvalidAddress { addr: u64, len: usize },
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error(transparent)]
    Cuda(#[from] CudaError),
}

/// Opaque device address. Only meaningful to the backend that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }

    pub fn addr(self) -> u64 {
        self.0
    }
}

/// Page-locked host memory. Not freed on drop: it goes back through
/// [`DeviceBackend::free_pinned`] of the backend that allocated it.
#[derive(Debug)]
pub struct PinnedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// the buffer is plain host memory owned by exactly one holder at a time
unsafe impl Send for PinnedBuffer {}

impl PinnedBuffer {
    /// # Safety
    /// `ptr` must point to `len` bytes that stay valid until the buffer is
    /// handed back to the backend that produced it.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Completion marker of one asynchronous copy.
pub trait Completion: Send {
    /// Blocks until the copy has finished on the device.
    fn wait(self: Box<Self>) -> Result<(), BackendError>;
}

pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Human readable names of the devices this backend can drive.
    fn list_devices(&self) -> Vec<String>;

    /// Selects the device used by subsequent calls. Not validated until
    /// [`activate`](DeviceBackend::activate).
    fn set_device(&self, index: usize);

    fn activate(&self) -> Result<(), BackendError>;

    fn total_memory(&self) -> Result<u64, BackendError>;

    fn alloc_device(&self, bytes: usize) -> Result<DevicePtr, BackendError>;

    fn free_device(&self, ptr: DevicePtr) -> Result<(), BackendError>;

    fn zero_device(&self, ptr: DevicePtr, bytes: usize) -> Result<(), BackendError>;

    fn alloc_pinned(&self, bytes: usize) -> Result<PinnedBuffer, BackendError>;

    fn free_pinned(&self, buf: PinnedBuffer) -> Result<(), BackendError>;

    /// Synchronous upload, returns once the data is on the device.
    fn copy_h2d(&self, dst: DevicePtr, src: &[u8]) -> Result<(), BackendError>;

    fn copy_d2h(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), BackendError>;

    /// Launches an upload of the first `len` bytes of `src` on a fresh
    /// stream and returns its completion marker.
    ///
    /// # Safety
    /// `src` must not be freed or written until the returned completion has
    /// been waited on.
    unsafe fn copy_h2d_async(
        &self,
        dst: DevicePtr,
        src: &PinnedBuffer,
        len: usize,
    ) -> Result<Box<dyn Completion>, BackendError>;

    /// Whole-device barrier: every copy issued so far has completed.
    fn synchronize(&self) -> Result<(), BackendError>;
}
