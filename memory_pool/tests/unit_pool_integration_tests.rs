use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use rand::seq::SliceRandom;
use rand::Rng;
use vram_memory_pool::{
    DeviceBackend, SimConfig, SimDevice, StagingOrigin, StagingRing, UnitPool, UNIT_SIZE,
};

fn sim() -> Arc<SimDevice> {
    Arc::new(SimDevice::new(SimConfig::default()))
}

#[test]
fn test_units_never_handed_out_twice() {
    let dev = sim();
    let pool = Arc::new(UnitPool::new(dev.clone()));
    pool.increase_pool(96 * UNIT_SIZE as u64);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut seen = Vec::new();
                let mut held = Vec::new();
                for _ in 0..200 {
                    if rng.gen_bool(0.6) {
                        if let Some(unit) = pool.allocate() {
                            held.push(unit);
                        }
                    } else if !held.is_empty() {
                        let i = rng.gen_range(0..held.len());
                        pool.release(held.swap_remove(i));
                    }
                }
                seen.extend(held.iter().map(|u| u.device_ptr()));
                (seen, held)
            })
        })
        .collect();

    let mut all = HashSet::new();
    let mut total = 0;
    let mut leftovers = Vec::new();
    for h in handles {
        let (seen, held) = h.join().unwrap();
        total += seen.len();
        all.extend(seen);
        leftovers.extend(held);
    }
    assert_eq!(all.len(), total, "a unit was bound by two holders");
    assert_eq!(pool.pool_available() + total, 96);

    for unit in leftovers {
        pool.release(unit);
    }
    assert_eq!(pool.pool_available(), 96);
}

#[test]
fn test_released_units_come_back_clean() {
    let dev = sim();
    let pool = UnitPool::new(dev.clone());
    pool.increase_pool(8 * UNIT_SIZE as u64);

    let mut units: Vec<_> = (0..8).map(|_| pool.allocate().unwrap()).collect();
    let mut rng = rand::thread_rng();
    for unit in &units {
        let off = rng.gen_range(0..UNIT_SIZE - 64);
        unit.write(dev.as_ref(), off, &[0xee; 64]).unwrap();
    }
    units.shuffle(&mut rng);
    for unit in units {
        pool.release(unit);
    }

    let mut block = vec![0u8; UNIT_SIZE];
    for _ in 0..8 {
        let unit = pool.allocate().unwrap();
        unit.read(dev.as_ref(), 0, &mut block).unwrap();
        assert!(block.iter().all(|&b| b == 0));
        pool.release(unit);
    }
}

#[test]
fn test_async_upload_through_ring_buffer() {
    let dev = sim();
    let pool = UnitPool::new(dev.clone());
    pool.increase_pool(UNIT_SIZE as u64);
    let ring = StagingRing::new(dev.clone(), 1);

    let unit = pool.allocate().unwrap();
    let mut staging = ring.checkout_or_alloc().unwrap();
    assert_eq!(staging.origin(), StagingOrigin::Ring);
    staging.as_mut_slice()[..5].copy_from_slice(b"vram!");
    let dst = unit.ptr_at(10, 5).unwrap();
    let done = unsafe { dev.copy_h2d_async(dst, staging.pinned(), 5) }.unwrap();
    done.wait().unwrap();
    ring.give_back(staging);

    let mut out = [0u8; 5];
    unit.read(dev.as_ref(), 10, &mut out).unwrap();
    assert_eq!(&out, b"vram!");
    assert_eq!(ring.available(), 1);

    pool.release(unit);
    ring.shutdown();
    pool.shutdown();
    assert_eq!(dev.live_pinned(), 0);
    assert_eq!(dev.live_allocations(), 0);
}
