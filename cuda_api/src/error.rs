#[derive(Debug, Clone, thiserror::Error)]
#[error("CUDA error [{file}:{line}] {call}: {message} (code {code})")]
pub struct CudaError {
    pub code: i32,
    pub message: String,
    pub call: &'static str,
    pub file: &'static str,
    pub line: u32,
}

impl CudaError {
    #[cfg(feature = "cuda")]
    pub fn from_code(
        code: crate::bindings::cudaError_t,
        call: &'static str,
        file: &'static str,
        line: u32,
    ) -> Self {
        // cudaGetErrorString returns a static string, also for unknown codes
        let message = unsafe {
            std::ffi::CStr::from_ptr(crate::bindings::cudaGetErrorString(code))
                .to_string_lossy()
                .into_owned()
        };
        Self {
            code: code as i32,
            message,
            call,
            file,
            line,
        }
    }
}

/// Evaluates a CUDA runtime call and turns its status code into
/// `Result<(), CudaError>`. Must be used inside an `unsafe` block.
#[macro_export]
macro_rules! cuda_call {
    ($x:expr) => {{
        let err = $x;
        if err != $crate::bindings::cudaError_cudaSuccess {
            Err($crate::error::CudaError::from_code(
                err,
                stringify!($x),
                file!(),
                line!(),
            ))
        } else {
            Ok(())
        }
    }};
}

#[cfg(all(test, feature = "cuda"))]
mod tests {
    use crate::bindings::*;

    #[test]
    fn invalid_device_is_reported_not_panicked() {
        let r = unsafe { cuda_call!(cudaSetDevice(-1)) };
        let err = r.unwrap_err();
        assert_ne!(err.code, 0);
        assert!(err.call.contains("cudaSetDevice"));
    }
}
