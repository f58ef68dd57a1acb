use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::{DeviceBackend, PinnedBuffer};
use crate::UNIT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingOrigin {
    /// Owned by the ring and returned to it after use.
    Ring,
    /// One-off allocation, freed after use.
    Ephemeral,
}

/// A pinned host buffer of [`UNIT_SIZE`] bytes checked out of a
/// [`StagingRing`].
#[derive(Debug)]
pub struct StagingBuffer {
    buf: PinnedBuffer,
    origin: StagingOrigin,
}

impl StagingBuffer {
    pub fn origin(&self) -> StagingOrigin {
        self.origin
    }

    pub fn pinned(&self) -> &PinnedBuffer {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }
}

struct RingInner {
    free: Vec<PinnedBuffer>,
    capacity: usize,
    shut_down: bool,
}

pub struct StagingRing {
    device: Arc<dyn DeviceBackend>,
    inner: Mutex<RingInner>,
}

impl StagingRing {
    /// Pre-allocates `count` pinned buffers. Either all of them are
    /// allocated or none are, in which case every write stages through
    /// ephemeral buffers.
    pub fn new(device: Arc<dyn DeviceBackend>, count: usize) -> Self {
        let mut free = Vec::with_capacity(count);
        for _ in 0..count {
            match device.alloc_pinned(UNIT_SIZE) {
                Ok(buf) => free.push(buf),
                Err(e) => {
                    warn!(
                        "staging: could only allocate {} of {} buffers ({}), running without a ring",
                        free.len(),
                        count,
                        e
                    );
                    for buf in free.drain(..) {
                        let _ = device.free_pinned(buf);
                    }
                    break;
                }
            }
        }
        let capacity = free.len();
        if capacity > 0 {
            info!("staging: ring of {} x {} bytes", capacity, UNIT_SIZE);
        }
        Self {
            device,
            inner: Mutex::new(RingInner {
                free,
                capacity,
                shut_down: false,
            }),
        }
    }

    pub fn checkout(&self) -> Option<StagingBuffer> {
        let buf = self.inner.lock().free.pop()?;
        Some(StagingBuffer {
            buf,
            origin: StagingOrigin::Ring,
        })
    }

    /// Ring buffer if one is free, otherwise a fresh ephemeral one. `None`
    /// only when pinned allocation fails too.
    pub fn checkout_or_alloc(&self) -> Option<StagingBuffer> {
        if let Some(buf) = self.checkout() {
            return Some(buf);
        }
        match self.device.alloc_pinned(UNIT_SIZE) {
            Ok(buf) => Some(StagingBuffer {
                buf,
                origin: StagingOrigin::Ephemeral,
            }),
            Err(e) => {
                debug!("staging: ephemeral allocation failed: {}", e);
                None
            }
        }
    }

    /// Takes a buffer back once its transfer has completed.
    pub fn give_back(&self, buf: StagingBuffer) {
        let StagingBuffer { buf, origin } = buf;
        {
            let mut inner = self.inner.lock();
            if origin == StagingOrigin::Ring && !inner.shut_down {
                inner.free.push(buf);
                return;
            }
        }
        if let Err(e) = self.device.free_pinned(buf) {
            warn!("staging: freeing {:?} buffer failed: {}", origin, e);
        }
    }

    /// Frees the ring. Buffers still checked out are freed when given back.
    pub fn shutdown(&self) {
        let (free, capacity) = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            (std::mem::take(&mut inner.free), inner.capacity)
        };
        if free.len() < capacity {
            warn!(
                "staging: {} ring buffers still checked out at shutdown",
                capacity - free.len()
            );
        }
        for buf in free {
            if let Err(e) = self.device.free_pinned(buf) {
                warn!("staging: freeing ring buffer failed: {}", e);
            }
        }
    }

    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }
}

impl Drop for StagingRing {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimConfig, SimDevice};

    fn sim() -> Arc<SimDevice> {
        Arc::new(SimDevice::new(SimConfig::default()))
    }

    #[test]
    fn ring_then_ephemeral() {
        let dev = sim();
        let ring = StagingRing::new(dev.clone(), 2);
        assert_eq!(ring.capacity(), 2);
        let a = ring.checkout_or_alloc().unwrap();
        let b = ring.checkout_or_alloc().unwrap();
        let c = ring.checkout_or_alloc().unwrap();
        assert_eq!(a.origin(), StagingOrigin::Ring);
        assert_eq!(b.origin(), StagingOrigin::Ring);
        assert_eq!(c.origin(), StagingOrigin::Ephemeral);
        assert!(ring.checkout().is_none());
        assert_eq!(dev.live_pinned(), 3);

        ring.give_back(c);
        assert_eq!(dev.live_pinned(), 2);
        assert_eq!(ring.available(), 0);
        ring.give_back(a);
        ring.give_back(b);
        assert_eq!(ring.available(), 2);
    }

    #[test]
    fn partial_ring_allocation_keeps_nothing() {
        let dev = sim();
        dev.set_fail_pinned_alloc(true);
        let ring = StagingRing::new(dev.clone(), 4);
        assert_eq!(ring.capacity(), 0);
        assert_eq!(dev.live_pinned(), 0);
        assert!(ring.checkout_or_alloc().is_none());
        dev.set_fail_pinned_alloc(false);
        let buf = ring.checkout_or_alloc().unwrap();
        assert_eq!(buf.origin(), StagingOrigin::Ephemeral);
        ring.give_back(buf);
        assert_eq!(dev.live_pinned(), 0);
    }

    #[test]
    fn give_back_after_shutdown_frees() {
        let dev = sim();
        let ring = StagingRing::new(dev.clone(), 3);
        let held = ring.checkout().unwrap();
        ring.shutdown();
        assert_eq!(dev.live_pinned(), 1);
        ring.give_back(held);
        assert_eq!(dev.live_pinned(), 0);
        assert_eq!(ring.available(), 0);
    }
}
