//! Thin safe-ish layer over the CUDA runtime API. Every call reports failure
//! through [`error::CudaError`] instead of aborting, so callers can decide
//! whether a failed allocation is fatal.

pub mod error;

#[cfg(feature = "cuda")]
#[allow(non_upper_case_globals, non_camel_case_types, non_snake_case, dead_code)]
pub mod bindings {
    include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
}

#[cfg(feature = "cuda")]
pub mod mem;
#[cfg(feature = "cuda")]
pub mod stream;
