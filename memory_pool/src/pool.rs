use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vram_common::define_usize_id;
use vram_common::heap::Heap;

use crate::device::{BackendError, DeviceBackend, DevicePtr};
use crate::unit::Unit;
use crate::{UNITS_PER_CHUNK, UNIT_SIZE};

define_usize_id!(UnitId);
define_usize_id!(ChunkId);

/// One bulk device allocation.
#[derive(Debug)]
struct Chunk {
    ptr: DevicePtr,
    bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    Free,
    Bound,
}

#[derive(Debug)]
struct UnitRecord {
    chunk: ChunkId,
    ptr: DevicePtr,
    state: UnitState,
    // set when a bound unit comes back; cleared by zeroing before the next bind
    dirty: bool,
}

#[derive(Default)]
struct PoolInner {
    chunks: Heap<ChunkId, Chunk>,
    units: Heap<UnitId, UnitRecord>,
    free: Vec<UnitId>,
    shut_down: bool,
}

/// Carves chunked device allocations into [`UNIT_SIZE`] units and hands
/// them out one at a time.
///
/// Unit records live in an arena indexed by [`UnitId`]; a [`Unit`] value is
/// the only handle to a bound record, and it is moved back in through
/// [`release`](UnitPool::release). Chunks are freed only at shutdown.
pub struct UnitPool {
    device: Arc<dyn DeviceBackend>,
    inner: Mutex<PoolInner>,
}

impl UnitPool {
    pub fn new(device: Arc<dyn DeviceBackend>) -> Self {
        Self {
            device,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn device(&self) -> &Arc<dyn DeviceBackend> {
        &self.device
    }

    /// Activates the configured device. Safe to call more than once.
    pub fn init(&self) -> Result<(), BackendError> {
        self.device.activate()
    }

    /// Grows the pool by `ceil(requested_bytes / UNIT_SIZE)` units and
    /// returns the bytes actually added. Growth stops at the first chunk
    /// that cannot be allocated; what was committed before stays.
    pub fn increase_pool(&self, requested_bytes: u64) -> u64 {
        let requested = requested_bytes.div_ceil(UNIT_SIZE as u64) as usize;
        let mut added = 0usize;
        while added < requested {
            if self.inner.lock().shut_down {
                warn!("pool: growth requested after shutdown");
                break;
            }
            let units = (requested - added).min(UNITS_PER_CHUNK);
            let bytes = units * UNIT_SIZE;
            let ptr = match self.device.alloc_device(bytes) {
                Ok(ptr) => ptr,
                Err(e) => {
                    warn!("pool: chunk allocation of {} bytes failed: {}", bytes, e);
                    break;
                }
            };
            if let Err(e) = self.device.zero_device(ptr, bytes) {
                warn!("pool: zeroing new chunk at {:#x} failed: {}", ptr.addr(), e);
                let _ = self.device.free_device(ptr);
                break;
            }

            let mut inner = self.inner.lock();
            let chunk = inner.chunks.push(Chunk { ptr, bytes });
            let first = inner.units.len();
            for i in 0..units {
                inner.units.push(UnitRecord {
                    chunk,
                    ptr: ptr.offset(i * UNIT_SIZE),
                    state: UnitState::Free,
                    dirty: false,
                });
            }
            // lowest address is handed out first
            inner
                .free
                .extend((first..first + units).rev().map(UnitId::from));
            added += units;
        }

        let inner = self.inner.lock();
        info!(
            "pool: added {} of {} requested units ({} units in {} chunks)",
            added,
            requested,
            inner.units.len(),
            inner.chunks.len()
        );
        (added * UNIT_SIZE) as u64
    }

    /// Takes a free unit, or `None` when the pool is empty. Never blocks on
    /// the device except to zero a unit that was bound before.
    pub fn allocate(&self) -> Option<Unit> {
        let (id, chunk, ptr, dirty) = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return None;
            }
            let id = inner.free.pop()?;
            let record = &mut inner.units[id];
            record.state = UnitState::Bound;
            (id, record.chunk, record.ptr, record.dirty)
        };

        if dirty {
            if let Err(e) = self.device.zero_device(ptr, UNIT_SIZE) {
                warn!("pool: zeroing reused {} failed: {}", id, e);
                let mut inner = self.inner.lock();
                inner.units[id].state = UnitState::Free;
                inner.free.push(id);
                return None;
            }
            self.inner.lock().units[id].dirty = false;
        }
        debug!("pool: bound {} in {} at {:#x}", id, chunk, ptr.addr());
        Some(Unit::new(id, ptr))
    }

    /// Returns a unit to the free list.
    pub fn release(&self, unit: Unit) {
        let id = unit.id();
        let mut inner = self.inner.lock();
        if inner.units.get(id).is_none() {
            warn!("pool: release of unknown {}", id);
            return;
        }
        let record = &mut inner.units[id];
        debug_assert_eq!(record.state, UnitState::Bound, "{} released twice", id);
        record.state = UnitState::Free;
        record.dirty = true;
        inner.free.push(id);
    }

    /// Units owned by the pool, bound or free.
    pub fn pool_size(&self) -> usize {
        self.inner.lock().units.len()
    }

    pub fn pool_available(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Frees every chunk. Units still bound at this point dangle, so the
    /// caller is expected to have released them.
    pub fn shutdown(&self) {
        let (chunks, outstanding) = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            let outstanding = inner
                .units
                .iter()
                .filter(|r| r.state == UnitState::Bound)
                .count();
            inner.free.clear();
            inner.units = Heap::new();
            (std::mem::take(&mut inner.chunks), outstanding)
        };
        if outstanding > 0 {
            warn!("pool: shutting down with {} units still bound", outstanding);
        }
        let count = chunks.len();
        for chunk in chunks.iter() {
            if let Err(e) = self.device.free_device(chunk.ptr) {
                warn!(
                    "pool: freeing chunk of {} bytes at {:#x} failed: {}",
                    chunk.bytes,
                    chunk.ptr.addr(),
                    e
                );
            }
        }
        info!("pool: released {} chunks", count);
    }
}

impl Drop for UnitPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimConfig, SimDevice};
    use crate::CHUNK_SIZE;

    fn sim(capacity: u64) -> Arc<SimDevice> {
        Arc::new(SimDevice::new(SimConfig {
            capacity,
            ..Default::default()
        }))
    }

    #[test]
    fn grows_by_whole_units_with_short_last_chunk() {
        let dev = sim(1 << 30);
        let pool = UnitPool::new(dev.clone());
        pool.init().unwrap();
        let added = pool.increase_pool((UNITS_PER_CHUNK as u64 + 6) * UNIT_SIZE as u64 - 1);
        assert_eq!(added, (UNITS_PER_CHUNK as u64 + 6) * UNIT_SIZE as u64);
        assert_eq!(pool.pool_size(), UNITS_PER_CHUNK + 6);
        assert_eq!(pool.pool_available(), UNITS_PER_CHUNK + 6);
        assert_eq!(dev.live_allocations(), 2);
        assert_eq!(dev.used_bytes(), added);
    }

    #[test]
    fn growth_stops_at_first_failed_chunk() {
        let dev = sim(CHUNK_SIZE as u64 + CHUNK_SIZE as u64 / 2);
        let pool = UnitPool::new(dev.clone());
        let added = pool.increase_pool(4 * CHUNK_SIZE as u64);
        assert_eq!(added, CHUNK_SIZE as u64);
        assert_eq!(pool.pool_size(), UNITS_PER_CHUNK);
        assert_eq!(pool.increase_pool(0), 0);
    }

    #[test]
    fn allocate_until_empty_then_release() {
        let dev = sim(1 << 30);
        let pool = UnitPool::new(dev);
        pool.increase_pool(3 * UNIT_SIZE as u64);
        let units: Vec<_> = (0..3).map(|_| pool.allocate().unwrap()).collect();
        assert!(pool.allocate().is_none());
        let mut ptrs: Vec<_> = units.iter().map(|u| u.device_ptr()).collect();
        ptrs.dedup();
        assert_eq!(ptrs.len(), 3);
        for unit in units {
            pool.release(unit);
        }
        assert_eq!(pool.pool_available(), 3);
    }

    #[test]
    fn reused_unit_is_zeroed() {
        let dev = sim(1 << 30);
        let pool = UnitPool::new(dev.clone());
        pool.increase_pool(UNIT_SIZE as u64);
        let unit = pool.allocate().unwrap();
        unit.write(dev.as_ref(), 0, &[7u8; 128]).unwrap();
        pool.release(unit);

        let unit = pool.allocate().unwrap();
        let mut out = [1u8; 128];
        unit.read(dev.as_ref(), 0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        pool.release(unit);
    }

    #[test]
    fn shutdown_frees_all_chunks() {
        let dev = sim(1 << 30);
        let pool = UnitPool::new(dev.clone());
        pool.increase_pool(2 * CHUNK_SIZE as u64);
        let unit = pool.allocate().unwrap();
        pool.release(unit);
        pool.shutdown();
        assert_eq!(dev.live_allocations(), 0);
        assert_eq!(pool.pool_size(), 0);
        assert!(pool.allocate().is_none());
        pool.shutdown();
    }
}
