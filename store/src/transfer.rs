//! Staged asynchronous writes.
//!
//! A write is copied into a pinned staging buffer, uploaded on its own
//! device stream, and handed to a completion worker that waits for the
//! upload, returns the buffer and records the outcome in the
//! [`TransferRegistry`]. The caller gets a [`TransferId`] back as soon as
//! the upload is queued.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use threadpool::ThreadPool;
use tracing::{debug, warn};
use vram_common::define_usize_id;
use vram_common::heap::IdAllocator;
use vram_memory_pool::{BackendError, DeviceBackend, StagingOrigin, StagingRing, Unit};

use crate::config::WriteMode;

define_usize_id!(TransferId);

#[derive(Debug, Clone)]
pub struct TransferFailure {
    pub id: TransferId,
    pub block: usize,
    pub error: BackendError,
}

struct RegistryState {
    ids: IdAllocator<TransferId>,
    pending: BTreeSet<TransferId>,
    failures: Vec<TransferFailure>,
}

/// Tracks every launched async transfer until a completion worker has
/// finished it.
pub struct TransferRegistry {
    state: Mutex<RegistryState>,
    changed: Condvar,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                ids: IdAllocator::new(),
                pending: BTreeSet::new(),
                failures: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    pub fn begin(&self) -> TransferId {
        let mut state = self.state.lock();
        let id = state.ids.alloc();
        state.pending.insert(id);
        id
    }

    pub fn finish(&self, id: TransferId, block: usize, outcome: Result<(), BackendError>) {
        let mut state = self.state.lock();
        let was_pending = state.pending.remove(&id);
        debug_assert!(was_pending, "{} finished twice", id);
        if let Err(error) = outcome {
            warn!("transfer: {} into block {} failed: {}", id, block, error);
            state.failures.push(TransferFailure { id, block, error });
        }
        self.changed.notify_all();
    }

    /// Most recently issued id, if any.
    pub fn last_issued(&self) -> Option<TransferId> {
        let issued = self.state.lock().ids.issued();
        issued.checked_sub(1).map(TransferId::from)
    }

    pub fn is_pending(&self, id: TransferId) -> bool {
        self.state.lock().pending.contains(&id)
    }

    pub fn wait(&self, id: TransferId) {
        let mut state = self.state.lock();
        while state.pending.contains(&id) {
            self.changed.wait(&mut state);
        }
    }

    /// Waits until every transfer with an id up to `upto` has finished.
    pub fn settle(&self, upto: TransferId) {
        let mut state = self.state.lock();
        while state.pending.range(..=upto).next().is_some() {
            self.changed.wait(&mut state);
        }
    }

    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while !state.pending.is_empty() {
            self.changed.wait(&mut state);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Failures recorded since the last call. Each one is reported once.
    pub fn take_failures(&self) -> Vec<TransferFailure> {
        std::mem::take(&mut self.state.lock().failures)
    }
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub ring_hits: u64,
    pub ephemeral: u64,
    pub sync_fallbacks: u64,
    pub in_flight: usize,
}

pub struct TransferEngine {
    device: Arc<dyn DeviceBackend>,
    ring: Arc<StagingRing>,
    workers: Mutex<ThreadPool>,
    registry: Arc<TransferRegistry>,
    ring_hits: AtomicU64,
    ephemeral: AtomicU64,
    sync_fallbacks: AtomicU64,
}

impl TransferEngine {
    pub fn new(device: Arc<dyn DeviceBackend>, ring: Arc<StagingRing>, workers: usize) -> Self {
        Self {
            device,
            ring,
            workers: Mutex::new(ThreadPool::with_name(
                "vram-completion".to_string(),
                workers.max(1),
            )),
            registry: Arc::new(TransferRegistry::new()),
            ring_hits: AtomicU64::new(0),
            ephemeral: AtomicU64::new(0),
            sync_fallbacks: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    /// Writes `data` at `block_offset` of `unit`. Returns the id of the
    /// async transfer when one was launched; `None` means the bytes are
    /// already on the device.
    pub fn write(
        &self,
        unit: &Unit,
        block: usize,
        block_offset: usize,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<Option<TransferId>, BackendError> {
        match mode {
            WriteMode::Sync => {
                unit.write(self.device.as_ref(), block_offset, data)?;
                Ok(None)
            }
            WriteMode::Async => self.write_async(unit, block, block_offset, data),
        }
    }

    fn write_async(
        &self,
        unit: &Unit,
        block: usize,
        block_offset: usize,
        data: &[u8],
    ) -> Result<Option<TransferId>, BackendError> {
        let dst = unit.ptr_at(block_offset, data.len())?;
        if data.is_empty() {
            return Ok(None);
        }
        let Some(mut staging) = self.ring.checkout_or_alloc() else {
            debug!(
                "transfer: no staging buffer for block {}, copying synchronously",
                block
            );
            self.sync_fallbacks.fetch_add(1, Ordering::Relaxed);
            unit.write(self.device.as_ref(), block_offset, data)?;
            return Ok(None);
        };
        match staging.origin() {
            StagingOrigin::Ring => self.ring_hits.fetch_add(1, Ordering::Relaxed),
            StagingOrigin::Ephemeral => self.ephemeral.fetch_add(1, Ordering::Relaxed),
        };

        staging.as_mut_slice()[..data.len()].copy_from_slice(data);
        // staging moves into the completion job and is given back only
        // after the upload has been waited on
        let launched = unsafe {
            self.device
                .copy_h2d_async(dst, staging.pinned(), data.len())
        };
        let completion = match launched {
            Ok(c) => c,
            Err(e) => {
                self.ring.give_back(staging);
                return Err(e);
            }
        };

        let id = self.registry.begin();
        let ring = self.ring.clone();
        let registry = self.registry.clone();
        self.workers.lock().execute(move || {
            let mut outcome = scopeguard::guard(
                Err(BackendError::Transfer(
                    "completion worker panicked".to_string(),
                )),
                move |outcome| registry.finish(id, block, outcome),
            );
            let _staging = scopeguard::guard(staging, move |buf| ring.give_back(buf));
            *outcome = completion.wait();
        });
        Ok(Some(id))
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            ring_hits: self.ring_hits.load(Ordering::Relaxed),
            ephemeral: self.ephemeral.load(Ordering::Relaxed),
            sync_fallbacks: self.sync_fallbacks.load(Ordering::Relaxed),
            in_flight: self.registry.in_flight(),
        }
    }

    /// Waits for every launched transfer and stops the workers.
    pub fn shutdown(&self) {
        self.registry.wait_idle();
        self.workers.lock().join();
    }
}
