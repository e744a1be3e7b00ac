use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DrmError {
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),

    #[error("DRM ioctl {op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Out of GPU memory or address space")]
    OutOfMemory,

    #[error("Out of host memory")]
    OutOfHostMemory,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation not supported by the kernel driver")]
    Unsupported,

    #[error("GPU hang detected during operation")]
    GpuHang,

    #[error("Operation timed out")]
    WaitTimeout,

    #[error("Memory operation failed: {0}")]
    Failed(String),
}

pub type DrmResult<T> = Result<T, DrmError>;

/// Coarse status reported to API-surface layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOperationsStatus {
    Success,
    OutOfMemory,
    InvalidArgument,
    Unsupported,
    GpuHang,
    Failed,
}

impl DrmError {
    /// Translates a failed ioctl into the status taxonomy.
    #[must_use]
    pub fn from_errno(op: &'static str, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOSPC | libc::ENOMEM) => Self::OutOfMemory,
            Some(libc::EOPNOTSUPP | libc::ENOTTY) => Self::Unsupported,
            Some(libc::EIO) => Self::GpuHang,
            Some(libc::ETIME) => Self::WaitTimeout,
            Some(libc::EINVAL) => Self::InvalidArgument(format!("{op}: {err}")),
            _ => Self::Ioctl { op, source: err },
        }
    }

    #[must_use]
    pub const fn status(&self) -> MemoryOperationsStatus {
        match self {
            Self::OutOfMemory | Self::OutOfHostMemory => MemoryOperationsStatus::OutOfMemory,
            Self::InvalidArgument(_) => MemoryOperationsStatus::InvalidArgument,
            Self::Unsupported => MemoryOperationsStatus::Unsupported,
            Self::GpuHang => MemoryOperationsStatus::GpuHang,
            Self::Io(_) | Self::Ioctl { .. } | Self::WaitTimeout | Self::Failed(_) => {
                MemoryOperationsStatus::Failed
            }
        }
    }

    /// Whether evicting unrelated memory and trying again can help.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Unsupported | Self::InvalidArgument(_) | Self::GpuHang
        )
    }
}

impl From<&DrmResult<()>> for MemoryOperationsStatus {
    fn from(result: &DrmResult<()>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => e.status(),
        }
    }
}
