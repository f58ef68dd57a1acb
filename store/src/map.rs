use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use vram_memory_pool::Unit;

use crate::transfer::TransferId;

#[derive(Debug, Default)]
pub struct SlotState {
    pub unit: Option<Unit>,
    /// Last async transfer launched into `unit`, not yet known complete.
    pub pending: Option<TransferId>,
}

/// One block of the address space. Its lock serializes every operation on
/// the block.
#[derive(Debug, Default)]
pub struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    pub fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }
}

/// Sparse block index -> slot table. The table lock guards only its shape;
/// slot contents have their own locks, always taken after the table lock
/// when both are held.
pub struct BackingMap {
    slots: Mutex<Vec<Option<Arc<Slot>>>>,
}

impl BackingMap {
    pub fn new(blocks: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(blocks, || None);
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, block: usize) -> Option<Arc<Slot>> {
        self.slots.lock().get(block)?.clone()
    }

    /// Looks the slot up, inserting an empty one if needed, in one critical
    /// section. `None` only for an index past the end of the table.
    pub fn get_or_create(&self, block: usize) -> Option<Arc<Slot>> {
        let mut slots = self.slots.lock();
        let entry = slots.get_mut(block)?;
        Some(entry.get_or_insert_with(Default::default).clone())
    }

    /// Visits occupied slots in block order with the table lock held.
    pub fn for_each_occupied<E>(
        &self,
        mut f: impl FnMut(usize, &Slot) -> Result<(), E>,
    ) -> Result<(), E> {
        let slots = self.slots.lock();
        for (block, slot) in slots.iter().enumerate() {
            if let Some(slot) = slot {
                f(block, slot)?;
            }
        }
        Ok(())
    }

    pub fn bound_blocks(&self) -> usize {
        let mut n = 0;
        let _ = self.for_each_occupied::<()>(|_, slot| {
            if slot.lock().unit.is_some() {
                n += 1;
            }
            Ok(())
        });
        n
    }

    /// Unbinds every unit, leaving all slots empty.
    pub fn drain_units(&self) -> Vec<Unit> {
        let mut slots = self.slots.lock();
        let mut units = Vec::new();
        for slot in slots.iter_mut() {
            if let Some(slot) = slot.take() {
                let mut state = slot.lock();
                state.pending = None;
                units.extend(state.unit.take());
            }
        }
        units
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_or_insert_returns_the_same_slot() {
        let map = BackingMap::new(4);
        assert!(map.get(1).is_none());
        let a = map.get_or_create(1).unwrap();
        let b = map.get_or_create(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &map.get(1).unwrap()));
        assert!(map.get_or_create(4).is_none());
    }

    #[test]
    fn visits_only_occupied_slots_in_order() {
        let map = BackingMap::new(8);
        map.get_or_create(5);
        map.get_or_create(2);
        let mut seen = Vec::new();
        map.for_each_occupied::<()>(|b, _| {
            seen.push(b);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![2, 5]);
        assert_eq!(map.bound_blocks(), 0);
    }

    #[test]
    fn concurrent_creation_yields_one_slot() {
        let map = Arc::new(BackingMap::new(1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                std::thread::spawn(move || map.get_or_create(0).unwrap())
            })
            .collect();
        let slots: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(slots.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
