use crate::device::{BackendError, DeviceBackend, DevicePtr};
use crate::pool::UnitId;
use crate::UNIT_SIZE;

/// One [`UNIT_SIZE`] region of device memory, bound to whoever holds the
/// value. Not `Clone`: a unit goes back to its pool only through
/// [`UnitPool::release`](crate::UnitPool::release).
#[derive(Debug)]
pub struct Unit {
    id: UnitId,
    ptr: DevicePtr,
}

impl Unit {
    pub(crate) fn new(id: UnitId, ptr: DevicePtr) -> Self {
        Self { id, ptr }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Address of `block_offset` inside this unit, checked against `len`.
    pub fn ptr_at(&self, block_offset: usize, len: usize) -> Result<DevicePtr, BackendError> {
        check_range(block_offset, len)?;
        Ok(self.ptr.offset(block_offset))
    }

    pub fn read(
        &self,
        device: &dyn DeviceBackend,
        block_offset: usize,
        out: &mut [u8],
    ) -> Result<(), BackendError> {
        let src = self.ptr_at(block_offset, out.len())?;
        if out.is_empty() {
            return Ok(());
        }
        device.copy_d2h(out, src)
    }

    /// Synchronous write, returns once the bytes are on the device.
    pub fn write(
        &self,
        device: &dyn DeviceBackend,
        block_offset: usize,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let dst = self.ptr_at(block_offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        device.copy_h2d(dst, data)
    }

    /// Whole-device barrier, not just this unit.
    pub fn synchronize(&self, device: &dyn DeviceBackend) -> Result<(), BackendError> {
        device.synchronize()
    }
}

fn check_range(block_offset: usize, len: usize) -> Result<(), BackendError> {
    match block_offset.checked_add(len) {
        Some(end) if end <= UNIT_SIZE => Ok(()),
        _ => Err(BackendError::OutOfBounds {
            offset: block_offset,
            len,
            limit: UNIT_SIZE,
        }),
    }
}

/// Reads from a block that may not be bound yet. Unbound blocks read as
/// zeros and never touch the device.
pub fn read_block(
    unit: Option<&Unit>,
    device: &dyn DeviceBackend,
    block_offset: usize,
    out: &mut [u8],
) -> Result<(), BackendError> {
    match unit {
        Some(unit) => unit.read(device, block_offset, out),
        None => {
            check_range(block_offset, out.len())?;
            out.fill(0);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimConfig, SimDevice};

    fn unit_on(dev: &SimDevice) -> Unit {
        let ptr = dev.alloc_device(UNIT_SIZE).unwrap();
        Unit::new(UnitId::from(0), ptr)
    }

    #[test]
    fn write_then_read_inside_unit() {
        let dev = SimDevice::new(SimConfig::default());
        let unit = unit_on(&dev);
        unit.write(&dev, 100, b"hello").unwrap();
        unit.synchronize(&dev).unwrap();
        let mut out = [0u8; 7];
        unit.read(&dev, 99, &mut out).unwrap();
        assert_eq!(&out, b"\0hello\0");
    }

    #[test]
    fn range_past_unit_end_is_rejected() {
        let dev = SimDevice::new(SimConfig::default());
        let unit = unit_on(&dev);
        let mut out = [0u8; 2];
        assert!(matches!(
            unit.read(&dev, UNIT_SIZE - 1, &mut out),
            Err(BackendError::OutOfBounds { .. })
        ));
        assert!(matches!(
            unit.write(&dev, usize::MAX, &[1]),
            Err(BackendError::OutOfBounds { .. })
        ));
        assert!(unit.write(&dev, UNIT_SIZE, &[]).is_ok());
    }

    #[test]
    fn unbound_block_reads_zero() {
        let dev = SimDevice::new(SimConfig::default());
        let mut out = [0xffu8; 32];
        read_block(None, &dev, 10, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(dev.live_allocations(), 0);
        assert!(read_block(None, &dev, UNIT_SIZE, &mut out).is_err());
    }
}
