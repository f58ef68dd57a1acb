use vram_memory_pool::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no usable device backend: {0}")]
    BackendUnavailable(String),
    #[error("range {offset}+{len} exceeds export size {size}")]
    OutOfRange { offset: u64, len: usize, size: u64 },
    #[error("no free unit left to back block {block}")]
    OutOfSpace { block: usize },
    #[error("device error: {0}")]
    Device(#[from] BackendError),
    #[error("{count} background transfer(s) failed, first: {first}")]
    TransferFailed { count: usize, first: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Negative errno for the protocol layer.
    pub fn to_errno(&self) -> i32 {
        match self {
            StoreError::OutOfRange { .. }
            | StoreError::Device(_)
            | StoreError::TransferFailed { .. } => -libc::EIO,
            StoreError::OutOfSpace { .. } => -libc::ENOSPC,
            StoreError::BackendUnavailable(_) => -libc::ENODEV,
            StoreError::Config(_) => -libc::EINVAL,
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let cases = [
            (
                StoreError::OutOfRange {
                    offset: 0,
                    len: 1,
                    size: 0,
                },
                -libc::EIO,
            ),
            (StoreError::OutOfSpace { block: 3 }, -libc::ENOSPC),
            (
                StoreError::Device(BackendError::Transfer("x".to_string())),
                -libc::EIO,
            ),
            (
                StoreError::TransferFailed {
                    count: 2,
                    first: "x".to_string(),
                },
                -libc::EIO,
            ),
            (
                StoreError::BackendUnavailable("none".to_string()),
                -libc::ENODEV,
            ),
            (StoreError::Config("bad".to_string()), -libc::EINVAL),
        ];
        for (err, errno) in cases {
            assert_eq!(err.to_errno(), errno, "{}", err);
        }
    }
}
