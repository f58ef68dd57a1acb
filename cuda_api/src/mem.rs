use crate::bindings::*;
use crate::cuda_call;
use crate::error::CudaError;
use std::ffi::{c_void, CStr};

pub fn device_count() -> Result<i32, CudaError> {
    let mut count = 0;
    unsafe { cuda_call!(cudaGetDeviceCount(&mut count)) }?;
    Ok(count)
}

pub fn set_device(device: i32) -> Result<(), CudaError> {
    unsafe { cuda_call!(cudaSetDevice(device)) }
}

pub fn device_name(device: i32) -> Result<String, CudaError> {
    unsafe {
        let mut prop: cudaDeviceProp = std::mem::zeroed();
        cuda_call!(cudaGetDeviceProperties_v2(&mut prop, device))?;
        Ok(CStr::from_ptr(prop.name.as_ptr())
            .to_string_lossy()
            .into_owned())
    }
}

/// `(free, total)` bytes of the current device.
pub fn mem_info(device: i32) -> Result<(usize, usize), CudaError> {
    let mut free = 0usize;
    let mut total = 0usize;
    unsafe {
        cuda_call!(cudaSetDevice(device))?;
        cuda_call!(cudaMemGetInfo(&mut free, &mut total))?;
    }
    Ok((free, total))
}

pub fn device_synchronize(device: i32) -> Result<(), CudaError> {
    unsafe {
        cuda_call!(cudaSetDevice(device))?;
        cuda_call!(cudaDeviceSynchronize())
    }
}

pub fn malloc_device(device: i32, size: usize) -> Result<*mut c_void, CudaError> {
    let mut ptr: *mut c_void = std::ptr::null_mut();
    unsafe {
        cuda_call!(cudaSetDevice(device))?;
        cuda_call!(cudaMalloc(&mut ptr, size))?;
    }
    Ok(ptr)
}

pub fn free_device(device: i32, ptr: *mut c_void) -> Result<(), CudaError> {
    unsafe {
        cuda_call!(cudaSetDevice(device))?;
        cuda_call!(cudaFree(ptr))
    }
}

pub fn memset_device(device: i32, ptr: *mut c_void, value: u8, size: usize) -> Result<(), CudaError> {
    unsafe {
        cuda_call!(cudaSetDevice(device))?;
        cuda_call!(cudaMemset(ptr, value as i32, size))
    }
}

pub fn alloc_pinned(size: usize) -> Result<*mut u8, CudaError> {
    let mut ptr: *mut c_void = std::ptr::null_mut();
    unsafe {
        cuda_call!(cudaHostAlloc(&mut ptr, size, cudaHostAllocDefault))?;
    }
    Ok(ptr as *mut u8)
}

pub fn free_pinned(ptr: *mut u8) -> Result<(), CudaError> {
    unsafe { cuda_call!(cudaFreeHost(ptr as *mut c_void)) }
}

pub fn cuda_h2d(device: i32, dst: *mut c_void, src: *const c_void, size: usize) -> Result<(), CudaError> {
    unsafe {
        cuda_call!(cudaSetDevice(device))?;
        cuda_call!(cudaMemcpy(
            dst,
            src,
            size,
            cudaMemcpyKind_cudaMemcpyHostToDevice
        ))
    }
}

pub fn cuda_d2h(device: i32, dst: *mut c_void, src: *const c_void, size: usize) -> Result<(), CudaError> {
    unsafe {
        cuda_call!(cudaSetDevice(device))?;
        cuda_call!(cudaMemcpy(
            dst,
            src,
            size,
            cudaMemcpyKind_cudaMemcpyDeviceToHost
        ))
    }
}

#[test]
fn test_device_round_trip() {
    let device = 0;
    let ptr = malloc_device(device, 9 * size_of::<i32>()).unwrap();
    let va = [1, 2, 3, 4, 5, 6, 7, 8, 9];
    let mut vb = [9, 8, 7, 6, 5, 4, 3, 2, 1];
    cuda_h2d(device, ptr, va.as_ptr() as *const c_void, 9 * size_of::<i32>()).unwrap();
    cuda_d2h(device, vb.as_mut_ptr() as *mut c_void, ptr, 9 * size_of::<i32>()).unwrap();
    free_device(device, ptr).unwrap();
    assert_eq!(va, vb);
}

#[test]
fn test_pinned_alloc() {
    let ptr = alloc_pinned(4096).unwrap();
    assert!(!ptr.is_null());
    unsafe {
        *ptr = 7;
        assert_eq!(*ptr, 7);
    }
    free_pinned(ptr).unwrap();
}
