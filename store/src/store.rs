use std::sync::Arc;

use tracing::{debug, info, warn};
use vram_memory_pool::{
    read_block, DeviceBackend, SimConfig, SimDevice, StagingRing, UnitPool, UNIT_SIZE,
};

use crate::config::{BackendKind, StoreConfig, WriteMode};
use crate::error::{Result, StoreError};
use crate::map::{BackingMap, SlotState};
use crate::splitter::split;
use crate::transfer::{TransferEngine, TransferFailure, TransferStats};

/// Block size negotiation reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizeHint {
    pub minimum: u32,
    pub preferred: u32,
    pub maximum: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub export_size: u64,
    pub bound_blocks: usize,
    pub pool_size: usize,
    pub pool_available: usize,
    pub staging_capacity: usize,
    pub transfers: TransferStats,
}

/// Sparse byte-addressed store over device memory units.
///
/// Blocks are bound to a unit on their first write and read as zeros until
/// then. Safe to share between threads; operations on one block are
/// serialized by that block's slot lock.
pub struct BlockStore {
    write_mode: WriteMode,
    size: u64,
    device: Arc<dyn DeviceBackend>,
    pool: UnitPool,
    ring: Arc<StagingRing>,
    engine: TransferEngine,
    map: BackingMap,
    torn_down: bool,
}

#[cfg(feature = "cuda")]
fn cuda_backend() -> Result<Arc<dyn DeviceBackend>> {
    Ok(Arc::new(vram_memory_pool::CudaDevice::new()))
}

#[cfg(not(feature = "cuda"))]
fn cuda_backend() -> Result<Arc<dyn DeviceBackend>> {
    Err(StoreError::BackendUnavailable(
        "built without the `cuda` feature".to_string(),
    ))
}

fn describe(failures: &[TransferFailure]) -> Option<StoreError> {
    let first = failures.first()?;
    Some(StoreError::TransferFailed {
        count: failures.len(),
        first: format!("{} into block {}: {}", first.id, first.block, first.error),
    })
}

impl BlockStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let device: Arc<dyn DeviceBackend> = match config.backend {
            BackendKind::Sim => Arc::new(SimDevice::new(SimConfig {
                capacity: config.sim_capacity.bytes(),
                ..Default::default()
            })),
            BackendKind::Cuda => cuda_backend()?,
        };
        Self::with_backend(config, device)
    }

    /// Builds the store on an already constructed backend.
    pub fn with_backend(config: StoreConfig, device: Arc<dyn DeviceBackend>) -> Result<Self> {
        config.validate()?;
        device.set_device(config.device);
        let pool = UnitPool::new(device.clone());
        pool.init()
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;

        let ring = Arc::new(StagingRing::new(device.clone(), config.staging_buffers));

        let size = match config.export_size {
            Some(size) => size.bytes(),
            None => {
                let total = device
                    .total_memory()
                    .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
                if total == 0 {
                    return Err(StoreError::BackendUnavailable(
                        "unable to query device memory".to_string(),
                    ));
                }
                let size = config.resolve_export_size(total);
                debug!("store: device total {} bytes, exporting {}", total, size);
                size
            }
        };

        let added = pool.increase_pool(size);
        if added < size {
            warn!(
                "store: pool backs only {} of {} exported bytes, writes beyond that fail",
                added, size
            );
        }
        let blocks = size.div_ceil(UNIT_SIZE as u64) as usize;
        let engine = TransferEngine::new(device.clone(), ring.clone(), config.completion_workers);
        info!(
            "store: {} backend ready, {} bytes in {} blocks, {:?} writes",
            device.name(),
            size,
            blocks,
            config.write_mode
        );

        Ok(Self {
            write_mode: config.write_mode,
            size,
            device,
            pool,
            ring,
            engine,
            map: BackingMap::new(blocks),
            torn_down: false,
        })
    }

    pub fn get_size(&self) -> u64 {
        self.size
    }

    pub fn can_write(&self) -> bool {
        true
    }

    pub fn can_flush(&self) -> bool {
        true
    }

    pub fn can_multi_conn(&self) -> bool {
        true
    }

    /// Forced unit access is not offered; callers flush instead.
    pub fn can_fua(&self) -> bool {
        false
    }

    pub fn block_size(&self) -> BlockSizeHint {
        let b = UNIT_SIZE as u32;
        BlockSizeHint {
            minimum: b,
            preferred: b,
            maximum: b,
        }
    }

    pub fn list_devices(&self) -> Vec<String> {
        self.device.list_devices()
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(StoreError::OutOfRange {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    fn await_pending(&self, state: &mut SlotState) {
        if let Some(id) = state.pending.take() {
            self.engine.registry().wait(id);
        }
    }

    /// Fills `buf` from `offset`. Never-written ranges read as zeros.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        for seg in split(offset, buf.len()) {
            let out = &mut buf[seg.buf_offset..seg.buf_offset + seg.len];
            let Some(slot) = self.map.get(seg.block) else {
                out.fill(0);
                continue;
            };
            let mut state = slot.lock();
            self.await_pending(&mut state);
            read_block(
                state.unit.as_ref(),
                self.device.as_ref(),
                seg.block_offset,
                out,
            )?;
        }
        Ok(())
    }

    /// Writes `data` at `offset`, binding units to blocks on first write.
    /// Fails with [`StoreError::OutOfSpace`] at the first block no unit is
    /// left for; segments before it stay written.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        for seg in split(offset, data.len()) {
            let slot = self
                .map
                .get_or_create(seg.block)
                .ok_or(StoreError::OutOfRange {
                    offset,
                    len: data.len(),
                    size: self.size,
                })?;
            let mut state = slot.lock();
            self.await_pending(&mut state);

            let (unit, fresh) = match state.unit.take() {
                Some(unit) => (unit, false),
                None => match self.pool.allocate() {
                    Some(unit) => (unit, true),
                    None => {
                        warn!("store: no free unit for block {}", seg.block);
                        return Err(StoreError::OutOfSpace { block: seg.block });
                    }
                },
            };

            let piece = &data[seg.buf_offset..seg.buf_offset + seg.len];
            let written = self
                .engine
                .write(&unit, seg.block, seg.block_offset, piece, self.write_mode)
                .and_then(|id| {
                    if self.write_mode == WriteMode::Sync {
                        unit.synchronize(self.device.as_ref())?;
                    }
                    Ok(id)
                });
            match written {
                Ok(id) => {
                    if fresh {
                        debug!("store: block {} bound to {}", seg.block, unit.id());
                    }
                    state.unit = Some(unit);
                    state.pending = id;
                }
                Err(e) => {
                    if fresh {
                        self.pool.release(unit);
                    } else {
                        state.unit = Some(unit);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Makes every write issued before the call durable on the device and
    /// reports background transfer failures recorded since the last flush.
    pub fn flush(&self) -> Result<()> {
        let upto = self.engine.registry().last_issued();
        self.map.for_each_occupied(|_, slot| {
            let state = slot.lock();
            if let Some(unit) = state.unit.as_ref() {
                unit.synchronize(self.device.as_ref())?;
            }
            Ok::<_, StoreError>(())
        })?;
        if let Some(upto) = upto {
            self.engine.registry().settle(upto);
        }
        if let Some(err) = describe(&self.engine.registry().take_failures()) {
            warn!("store: flush found {}", err);
            return Err(err);
        }
        debug!("store: flush complete");
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            export_size: self.size,
            bound_blocks: self.map.bound_blocks(),
            pool_size: self.pool.pool_size(),
            pool_available: self.pool.pool_available(),
            staging_capacity: self.ring.capacity(),
            transfers: self.engine.stats(),
        }
    }

    /// Tears the store down and reports transfer failures no flush has
    /// seen yet.
    pub fn close(mut self) -> Result<()> {
        match describe(&self.teardown()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // order matters: in-flight uploads still reference staging buffers and
    // units, so the engine drains before either is freed
    fn teardown(&mut self) -> Vec<TransferFailure> {
        if self.torn_down {
            return Vec::new();
        }
        self.torn_down = true;

        self.engine.shutdown();
        let failures = self.engine.registry().take_failures();
        let units = self.map.drain_units();
        let bound = units.len();
        for unit in units {
            self.pool.release(unit);
        }
        self.ring.shutdown();
        self.pool.shutdown();
        info!("store: closed, {} bound units returned", bound);
        failures
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        let failures = self.teardown();
        if !failures.is_empty() {
            warn!(
                "store: dropped with {} unreported transfer failures",
                failures.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vram_common::size::ByteSize;

    fn assert_send_sync<T: Send + Sync>() {}

    fn small(blocks: u64) -> StoreConfig {
        StoreConfig {
            backend: BackendKind::Sim,
            export_size: Some(ByteSize(blocks * UNIT_SIZE as u64)),
            staging_buffers: 2,
            ..Default::default()
        }
    }

    #[test]
    fn store_is_shareable() {
        assert_send_sync::<BlockStore>();
    }

    #[test]
    fn capabilities() {
        let store = BlockStore::open(small(4)).unwrap();
        assert_eq!(store.get_size(), 4 * UNIT_SIZE as u64);
        assert!(store.can_write() && store.can_flush() && store.can_multi_conn());
        assert!(!store.can_fua());
        let hint = store.block_size();
        assert_eq!(hint.minimum, 65536);
        assert_eq!(hint.preferred, hint.maximum);
        assert_eq!(store.list_devices().len(), 1);
    }

    #[test]
    fn derived_export_size_leaves_reserve() {
        let config = StoreConfig {
            backend: BackendKind::Sim,
            sim_capacity: ByteSize::mib(300),
            ..Default::default()
        };
        let store = BlockStore::open(config).unwrap();
        assert_eq!(store.get_size(), 44 << 20);
        assert_eq!(store.stats().pool_size, (44 << 20) / UNIT_SIZE);
    }

    #[test]
    fn sync_write_is_visible_without_flush() {
        let store = BlockStore::open(small(2)).unwrap();
        store.write(UNIT_SIZE as u64 - 2, b"abcd").unwrap();
        let mut out = [0u8; 6];
        store.read(UNIT_SIZE as u64 - 3, &mut out).unwrap();
        assert_eq!(&out, b"\0abcd\0");
        assert_eq!(store.stats().bound_blocks, 2);
        assert_eq!(store.stats().transfers, TransferStats::default());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn cuda_backend_needs_feature() {
        let config = StoreConfig {
            backend: BackendKind::Cuda,
            ..Default::default()
        };
        assert!(matches!(
            BlockStore::open(config),
            Err(StoreError::BackendUnavailable(_))
        ));
    }
}
