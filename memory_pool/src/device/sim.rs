//! Software device: "device memory" is host memory behind a lock, and the
//! async copy engine is a single worker thread fed through a channel, which
//! gives the same ordering model as one in-order device queue. Faults can be
//! injected at runtime so the error paths of the pools can be exercised
//! without hardware.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use super::{BackendError, Completion, DeviceBackend, DevicePtr, PinnedBuffer};

const SIM_BASE_ADDR: u64 = 0x7f00_0000_0000;
const SIM_PAGE: u64 = 4096;

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Bytes of "device memory" that can be allocated in total.
    pub capacity: u64,
    /// When false, activation fails as if no device were present.
    pub available: bool,
    /// Artificial delay applied to every async copy before it lands.
    pub copy_latency: Option<Duration>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 30,
            available: true,
            copy_latency: None,
        }
    }
}

struct SimMemory {
    next_addr: u64,
    used: u64,
    regions: BTreeMap<u64, Box<[u8]>>,
}

impl SimMemory {
    fn locate(&self, addr: u64, len: usize) -> Result<(u64, usize), BackendError> {
        let invalid = BackendError::InvalidAddress { addr, len };
        let (&base, region) = self.regions.range(..=addr).next_back().ok_or(invalid.clone())?;
        let start = (addr - base) as usize;
        if start + len > region.len() {
            return Err(invalid);
        }
        Ok((base, start))
    }

    fn read(&self, src: DevicePtr, dst: &mut [u8]) -> Result<(), BackendError> {
        let (base, start) = self.locate(src.addr(), dst.len())?;
        dst.copy_from_slice(&self.regions[&base][start..start + dst.len()]);
        Ok(())
    }

    fn write(&mut self, dst: DevicePtr, src: &[u8]) -> Result<(), BackendError> {
        let (base, start) = self.locate(dst.addr(), src.len())?;
        let region = self.regions.get_mut(&base).ok_or(BackendError::InvalidAddress {
            addr: dst.addr(),
            len: src.len(),
        })?;
        region[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn fill(&mut self, dst: DevicePtr, len: usize, value: u8) -> Result<(), BackendError> {
        let (base, start) = self.locate(dst.addr(), len)?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or(BackendError::InvalidAddress { addr: dst.addr(), len })?;
        region[start..start + len].fill(value);
        Ok(())
    }
}

struct SendPtr(*const u8);

// points into a pinned buffer the caller keeps alive until the job completes
unsafe impl Send for SendPtr {}

enum SimJob {
    Upload {
        dst: DevicePtr,
        src: SendPtr,
        len: usize,
        fail: bool,
        done: Sender<Result<(), BackendError>>,
    },
    Barrier {
        done: Sender<()>,
    },
}

struct SimCompletion {
    done: Receiver<Result<(), BackendError>>,
}

impl Completion for SimCompletion {
    fn wait(self: Box<Self>) -> Result<(), BackendError> {
        self.done
            .recv()
            .map_err(|_| BackendError::Transfer("simulated stream shut down".to_string()))?
    }
}

pub struct SimDevice {
    config: SimConfig,
    device: AtomicUsize,
    memory: Arc<Mutex<SimMemory>>,
    jobs: Option<Sender<SimJob>>,
    worker: Option<JoinHandle<()>>,
    fail_async_copies: AtomicBool,
    fail_pinned_alloc: AtomicBool,
    live_pinned: AtomicUsize,
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        let memory = Arc::new(Mutex::new(SimMemory {
            next_addr: SIM_BASE_ADDR,
            used: 0,
            regions: BTreeMap::new(),
        }));
        let (jobs, rx) = unbounded();
        let worker = {
            let memory = memory.clone();
            let latency = config.copy_latency;
            thread::spawn(move || run_copy_engine(memory, latency, rx))
        };
        Self {
            config,
            device: AtomicUsize::new(0),
            memory,
            jobs: Some(jobs),
            worker: Some(worker),
            fail_async_copies: AtomicBool::new(false),
            fail_pinned_alloc: AtomicBool::new(false),
            live_pinned: AtomicUsize::new(0),
        }
    }

    /// Makes every subsequently launched async copy report failure without
    /// writing anything.
    pub fn set_fail_async_copies(&self, fail: bool) {
        self.fail_async_copies.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_pinned_alloc(&self, fail: bool) {
        self.fail_pinned_alloc.store(fail, Ordering::SeqCst);
    }

    pub fn live_pinned(&self) -> usize {
        self.live_pinned.load(Ordering::SeqCst)
    }

    pub fn live_allocations(&self) -> usize {
        self.memory.lock().regions.len()
    }

    pub fn used_bytes(&self) -> u64 {
        self.memory.lock().used
    }
}

fn run_copy_engine(
    memory: Arc<Mutex<SimMemory>>,
    latency: Option<Duration>,
    jobs: Receiver<SimJob>,
) {
    for job in jobs.iter() {
        match job {
            SimJob::Upload {
                dst,
                src,
                len,
                fail,
                done,
            } => {
                if let Some(d) = latency {
                    thread::sleep(d);
                }
                let result = if fail {
                    Err(BackendError::Transfer(format!(
                        "injected failure uploading {} bytes to {:#x}",
                        len,
                        dst.addr()
                    )))
                } else {
                    let data = unsafe { std::slice::from_raw_parts(src.0, len) };
                    memory.lock().write(dst, data)
                };
                let _ = done.send(result);
            }
            SimJob::Barrier { done } => {
                let _ = done.send(());
            }
        }
    }
}

impl DeviceBackend for SimDevice {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn list_devices(&self) -> Vec<String> {
        if self.config.available {
            vec![format!("simulated device ({} bytes)", self.config.capacity)]
        } else {
            Vec::new()
        }
    }

    fn set_device(&self, index: usize) {
        self.device.store(index, Ordering::SeqCst);
    }

    fn activate(&self) -> Result<(), BackendError> {
        if !self.config.available {
            return Err(BackendError::Unavailable(
                "no simulated device present".to_string(),
            ));
        }
        if self.device.swap(0, Ordering::SeqCst) != 0 {
            debug!("sim: only device 0 exists, falling back to it");
        }
        Ok(())
    }

    fn total_memory(&self) -> Result<u64, BackendError> {
        Ok(self.config.capacity)
    }

    fn alloc_device(&self, bytes: usize) -> Result<DevicePtr, BackendError> {
        let mut mem = self.memory.lock();
        if mem.used + bytes as u64 > self.config.capacity {
            return Err(BackendError::OutOfMemory { bytes });
        }
        let addr = mem.next_addr;
        // leave a guard page so neighbouring regions never touch
        mem.next_addr += (bytes as u64).div_ceil(SIM_PAGE) * SIM_PAGE + SIM_PAGE;
        mem.used += bytes as u64;
        mem.regions.insert(addr, vec![0u8; bytes].into_boxed_slice());
        Ok(DevicePtr(addr))
    }

    fn free_device(&self, ptr: DevicePtr) -> Result<(), BackendError> {
        let mut mem = self.memory.lock();
        let region = mem
            .regions
            .remove(&ptr.addr())
            .ok_or(BackendError::InvalidAddress {
                addr: ptr.addr(),
                len: 0,
            })?;
        mem.used -= region.len() as u64;
        Ok(())
    }

    fn zero_device(&self, ptr: DevicePtr, bytes: usize) -> Result<(), BackendError> {
        self.memory.lock().fill(ptr, bytes, 0)
    }

    fn alloc_pinned(&self, bytes: usize) -> Result<PinnedBuffer, BackendError> {
        if self.fail_pinned_alloc.load(Ordering::SeqCst) {
            return Err(BackendError::PinnedAlloc { bytes });
        }
        let raw = Box::into_raw(vec![0u8; bytes].into_boxed_slice()) as *mut u8;
        let ptr = NonNull::new(raw).ok_or(BackendError::PinnedAlloc { bytes })?;
        self.live_pinned.fetch_add(1, Ordering::SeqCst);
        Ok(unsafe { PinnedBuffer::from_raw(ptr, bytes) })
    }

    fn free_pinned(&self, mut buf: PinnedBuffer) -> Result<(), BackendError> {
        let slice = std::ptr::slice_from_raw_parts_mut(buf.as_mut_ptr(), buf.len());
        // produced by Box::into_raw in alloc_pinned with the same length
        drop(unsafe { Box::from_raw(slice) });
        self.live_pinned.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn copy_h2d(&self, dst: DevicePtr, src: &[u8]) -> Result<(), BackendError> {
        self.memory.lock().write(dst, src)
    }

    fn copy_d2h(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), BackendError> {
        self.memory.lock().read(src, dst)
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
        let jobs = self
            .jobs
            .as_ref()
            .ok_or(BackendError::Unavailable("simulated stream shut down".to_string()))?;
        let (done, rx) = bounded(1);
        jobs.send(SimJob::Upload {
            dst,
            src: SendPtr(src.as_ptr()),
            len,
            fail: self.fail_async_copies.load(Ordering::SeqCst),
            done,
        })
        .map_err(|_| BackendError::Unavailable("simulated stream shut down".to_string()))?;
        Ok(Box::new(SimCompletion { done: rx }))
    }

    fn synchronize(&self) -> Result<(), BackendError> {
        let Some(jobs) = self.jobs.as_ref() else {
            return Ok(());
        };
        let (done, rx) = bounded(1);
        if jobs.send(SimJob::Barrier { done }).is_err() {
            return Ok(());
        }
        rx.recv()
            .map_err(|_| BackendError::Transfer("simulated stream shut down".to_string()))
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        // closing the channel lets the engine drain queued copies and exit
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_bounds_allocations() {
        let dev = SimDevice::new(SimConfig {
            capacity: 8192,
            ..Default::default()
        });
        let a = dev.alloc_device(4096).unwrap();
        let _b = dev.alloc_device(4096).unwrap();
        assert!(matches!(
            dev.alloc_device(1),
            Err(BackendError::OutOfMemory { bytes: 1 })
        ));
        dev.free_device(a).unwrap();
        assert_eq!(dev.used_bytes(), 4096);
        assert!(dev.alloc_device(4096).is_ok());
    }

    #[test]
    fn copies_stay_inside_their_region() {
        let dev = SimDevice::new(SimConfig::default());
        let p = dev.alloc_device(16).unwrap();
        dev.copy_h2d(p.offset(8), &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 16];
        dev.copy_d2h(&mut out, p).unwrap();
        assert_eq!(&out[8..12], &[1, 2, 3, 4]);
        assert!(matches!(
            dev.copy_h2d(p.offset(14), &[0; 4]),
            Err(BackendError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn async_upload_lands_after_wait() {
        let dev = SimDevice::new(SimConfig {
            copy_latency: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let p = dev.alloc_device(64).unwrap();
        let mut buf = dev.alloc_pinned(64).unwrap();
        buf.as_mut_slice().fill(0xab);
        let done = unsafe { dev.copy_h2d_async(p, &buf, 64) }.unwrap();
        done.wait().unwrap();
        let mut out = [0u8; 64];
        dev.copy_d2h(&mut out, p).unwrap();
        assert!(out.iter().all(|&b| b == 0xab));
        dev.free_pinned(buf).unwrap();
        assert_eq!(dev.live_pinned(), 0);
    }

    #[test]
    fn synchronize_drains_queued_uploads() {
        let dev = SimDevice::new(SimConfig {
            copy_latency: Some(Duration::from_millis(5)),
            ..Default::default()
        });
        let p = dev.alloc_device(8).unwrap();
        let mut buf = dev.alloc_pinned(8).unwrap();
        buf.as_mut_slice().copy_from_slice(b"abcdefgh");
        let done = unsafe { dev.copy_h2d_async(p, &buf, 8) }.unwrap();
        dev.synchronize().unwrap();
        let mut out = [0u8; 8];
        dev.copy_d2h(&mut out, p).unwrap();
        assert_eq!(&out, b"abcdefgh");
        done.wait().unwrap();
        dev.free_pinned(buf).unwrap();
    }

    #[test]
    fn injected_faults() {
        let dev = SimDevice::new(SimConfig::default());
        dev.set_fail_pinned_alloc(true);
        assert!(matches!(
            dev.alloc_pinned(16),
            Err(BackendError::PinnedAlloc { bytes: 16 })
        ));
        dev.set_fail_pinned_alloc(false);

        let p = dev.alloc_device(16).unwrap();
        let buf = dev.alloc_pinned(16).unwrap();
        dev.set_fail_async_copies(true);
        let done = unsafe { dev.copy_h2d_async(p, &buf, 16) }.unwrap();
        assert!(matches!(done.wait(), Err(BackendError::Transfer(_))));
        dev.free_pinned(buf).unwrap();
    }

    #[test]
    fn unavailable_device_fails_activation() {
        let dev = SimDevice::new(SimConfig {
            available: false,
            ..Default::default()
        });
        assert!(dev.list_devices().is_empty());
        assert!(matches!(dev.activate(), Err(BackendError::Unavailable(_))));
    }
}
