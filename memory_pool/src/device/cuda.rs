use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};
use vram_cuda_api::mem;
use vram_cuda_api::stream::{CudaEvent, CudaStream};

use super::{BackendError, Completion, DeviceBackend, DevicePtr, PinnedBuffer};

/// Backend driving one CUDA device through the runtime API.
pub struct CudaDevice {
    device: AtomicUsize,
}

impl CudaDevice {
    pub fn new() -> Self {
        Self {
            device: AtomicUsize::new(0),
        }
    }

    fn device_id(&self) -> i32 {
        self.device.load(Ordering::SeqCst) as i32
    }
}

impl Default for CudaDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the launching stream alive until its event has been synced.
struct CudaCompletion {
    _stream: CudaStream,
    event: CudaEvent,
}

impl Completion for CudaCompletion {
    fn wait(self: Box<Self>) -> Result<(), BackendError> {
        self.event.sync()?;
        Ok(())
    }
}

impl DeviceBackend for CudaDevice {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn list_devices(&self) -> Vec<String> {
        let count = mem::device_count().unwrap_or(0);
        (0..count)
            .map(|i| mem::device_name(i).unwrap_or_else(|e| format!("device {} ({})", i, e)))
            .collect()
    }

    fn set_device(&self, index: usize) {
        self.device.store(index, Ordering::SeqCst);
    }

    fn activate(&self) -> Result<(), BackendError> {
        let count = mem::device_count().map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if count <= 0 {
            return Err(BackendError::Unavailable("no CUDA devices found".to_string()));
        }
        if self.device_id() >= count {
            debug!(
                "cuda: device {} out of range ({} present), using device 0",
                self.device_id(),
                count
            );
            self.device.store(0, Ordering::SeqCst);
        }
        mem::set_device(self.device_id()).map_err(|e| BackendError::Unavailable(e.to_string()))?;
        info!("cuda: initialized device {}", self.device_id());
        Ok(())
    }

    fn total_memory(&self) -> Result<u64, BackendError> {
        let (_, total) = mem::mem_info(self.device_id())?;
        Ok(total as u64)
    }

    fn alloc_device(&self, bytes: usize) -> Result<DevicePtr, BackendError> {
        let ptr = mem::malloc_device(self.device_id(), bytes).map_err(|e| {
            debug!("cuda: cudaMalloc of {} bytes failed: {}", bytes, e);
            BackendError::OutOfMemory { bytes }
        })?;
        Ok(DevicePtr(ptr as u64))
    }

    fn free_device(&self, ptr: DevicePtr) -> Result<(), BackendError> {
        mem::free_device(self.device_id(), ptr.addr() as *mut c_void)?;
        Ok(())
    }

    fn zero_device(&self, ptr: DevicePtr, bytes: usize) -> Result<(), BackendError> {
        mem::memset_device(self.device_id(), ptr.addr() as *mut c_void, 0, bytes)?;
        Ok(())
    }

    fn alloc_pinned(&self, bytes: usize) -> Result<PinnedBuffer, BackendError> {
        let raw = mem::alloc_pinned(bytes).map_err(|e| {
            debug!("cuda: cudaHostAlloc of {} bytes failed: {}", bytes, e);
            BackendError::PinnedAlloc { bytes }
        })?;
        let ptr = NonNull::new(raw).ok_or(BackendError::PinnedAlloc { bytes })?;
        Ok(unsafe { PinnedBuffer::from_raw(ptr, bytes) })
    }

    fn free_pinned(&self, mut buf: PinnedBuffer) -> Result<(), BackendError> {
        mem::free_pinned(buf.as_mut_ptr())?;
        Ok(())
    }

    fn copy_h2d(&self, dst: DevicePtr, src: &[u8]) -> Result<(), BackendError> {
        mem::cuda_h2d(
            self.device_id(),
            dst.addr() as *mut c_void,
            src.as_ptr() as *const c_void,
            src.len(),
        )?;
        Ok(())
    }

    fn copy_d2h(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), BackendError> {
        mem::cuda_d2h(
            self.device_id(),
            dst.as_mut_ptr() as *mut c_void,
            src.addr() as *const c_void,
            dst.len(),
        )?;
        Ok(())
    }

    unsafe fn copy_h2d_async(
        &self,
        dst: DevicePtr,
        src: &PinnedBuffer,
        len: usize,
    ) -> Result<Box<dyn Completion>, BackendError> {
        if len > src.len() {
            return Err(BackendError::OutOfBounds {
                offset: 0,
                len,
                limit: src.len(),
            });
        }
        let device = self.device_id();
        let stream = CudaStream::non_blocking(device)?;
        // created before the launch so a failure here leaves nothing in flight
        let event = CudaEvent::new(device)?;
        stream.memcpy_h2d(dst.addr() as *mut u8, src.as_ptr(), len)?;
        if let Err(e) = stream.record(&event) {
            // the copy is queued but unobservable, so drain it before the
            // caller reuses the buffer
            let _ = stream.sync();
            return Err(e.into());
        }
        Ok(Box::new(CudaCompletion {
            _stream: stream,
            event,
        }))
    }

    fn synchronize(&self) -> Result<(), BackendError> {
        mem::device_synchronize(self.device_id())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_upload_round_trip() {
        let dev = CudaDevice::new();
        dev.activate().unwrap();
        let dst = dev.alloc_device(4096).unwrap();
        let mut buf = dev.alloc_pinned(4096).unwrap();
        buf.as_mut_slice().fill(0x5a);
        let done = unsafe { dev.copy_h2d_async(dst, &buf, 4096) }.unwrap();
        done.wait().unwrap();
        let mut out = vec![0u8; 4096];
        dev.copy_d2h(&mut out, dst).unwrap();
        assert!(out.iter().all(|&b| b == 0x5a));
        dev.free_pinned(buf).unwrap();
        dev.free_device(dst).unwrap();
    }
}
