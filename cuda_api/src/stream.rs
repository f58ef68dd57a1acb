use vram_common::cpu_event::CpuEvent;

use crate::bindings::*;
use crate::cuda_call;
use crate::error::CudaError;

// the semantics of CudaEvent is slightly different from cudaEvent_t:
// waiting on it from another thread blocks until some thread has recorded it,
// so a completion worker can never sync an event that was not yet enqueued.
// An event is recorded once.
pub struct CudaEvent {
    event: cudaEvent_t,
    event_ready: CpuEvent,
    device_id: i32,
}

impl CudaEvent {
    pub fn new(device_id: i32) -> Result<Self, CudaError> {
        let mut event: cudaEvent_t = std::ptr::null_mut();
        unsafe {
            cuda_call!(cudaSetDevice(device_id))?;
            cuda_call!(cudaEventCreateWithFlags(
                &mut event,
                cudaEventBlockingSync | cudaEventDisableTiming
            ))?;
        }
        Ok(Self {
            event,
            event_ready: CpuEvent::new(),
            device_id,
        })
    }

    pub fn get_device(&self) -> i32 {
        self.device_id
    }

    pub fn record(&self, stream: &CudaStream) -> Result<(), CudaError> {
        unsafe {
            cuda_call!(cudaSetDevice(self.device_id))?;
            cuda_call!(cudaEventRecord(self.event, stream.raw()))?;
        }
        self.event_ready.notify();
        Ok(())
    }

    pub fn sync(&self) -> Result<(), CudaError> {
        self.event_ready.wait();
        unsafe {
            cuda_call!(cudaSetDevice(self.device_id))?;
            cuda_call!(cudaEventSynchronize(self.event))
        }
    }
}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        unsafe {
            let _ = cudaSetDevice(self.device_id);
            let _ = cudaEventDestroy(self.event);
        }
    }
}

/// Owned stream. Destroying a stream with pending work is legal in CUDA, the
/// work still completes, but callers keep it alive until their event syncs.
#[derive(Debug)]
pub struct CudaStream {
    stream: cudaStream_t,
    gpu_id: i32,
}

impl CudaStream {
    /// A stream that does not implicitly synchronize with the legacy default
    /// stream.
    pub fn non_blocking(device: i32) -> Result<Self, CudaError> {
        let mut stream: cudaStream_t = std::ptr::null_mut();
        unsafe {
            cuda_call!(cudaSetDevice(device))?;
            cuda_call!(cudaStreamCreateWithFlags(&mut stream, cudaStreamNonBlocking))?;
        }
        Ok(Self {
            stream,
            gpu_id: device,
        })
    }

    pub fn sync(&self) -> Result<(), CudaError> {
        unsafe {
            cuda_call!(cudaSetDevice(self.gpu_id))?;
            cuda_call!(cudaStreamSynchronize(self.stream))
        }
    }

    pub fn raw(&self) -> cudaStream_t {
        self.stream
    }

    pub fn get_device(&self) -> i32 {
        self.gpu_id
    }

    pub fn record(&self, event: &CudaEvent) -> Result<(), CudaError> {
        event.record(self)
    }

    /// Enqueues a host-to-device copy. `src` must stay valid (and should be
    /// pinned) until an event recorded after this call has synced.
    pub fn memcpy_h2d(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<(), CudaError> {
        unsafe {
            cuda_call!(cudaSetDevice(self.gpu_id))?;
            cuda_call!(cudaMemcpyAsync(
                dst as *mut std::ffi::c_void,
                src as *const std::ffi::c_void,
                size,
                cudaMemcpyKind_cudaMemcpyHostToDevice,
                self.stream,
            ))
        }
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        unsafe {
            let _ = cudaSetDevice(self.gpu_id);
            let _ = cudaStreamDestroy(self.stream);
        }
    }
}

unsafe impl Send for CudaStream {}
unsafe impl Sync for CudaStream {}

unsafe impl Send for CudaEvent {}
unsafe impl Sync for CudaEvent {}

#[test]
fn test_cuda_stream() {
    let stream = CudaStream::non_blocking(0).unwrap();
    let event = CudaEvent::new(0).unwrap();
    let src = crate::mem::alloc_pinned(1024).unwrap();
    let dst = crate::mem::malloc_device(0, 1024).unwrap();
    stream.memcpy_h2d(dst as *mut u8, src, 1024).unwrap();
    stream.record(&event).unwrap();
    event.sync().unwrap();
    stream.sync().unwrap();
    crate::mem::free_device(0, dst).unwrap();
    crate::mem::free_pinned(src).unwrap();
}
