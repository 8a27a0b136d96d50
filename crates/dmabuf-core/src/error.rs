//! Error types for dmabuf

use std::collections::TryReserveError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("no free descriptor slots")]
    ResourceExhausted,

    #[error("bad descriptor: {0}")]
    NotFound(i32),

    #[error("buffer is locked")]
    WouldBlock,

    #[error("fence context already set")]
    Busy,

    #[error("synchronization not supported by this buffer")]
    PermissionDenied,

    #[error("bad fence context")]
    Fault,

    #[error("page offset overflow")]
    Overflow,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("timed out waiting for buffer")]
    TimedOut,

    #[error("shared memory error: {0}")]
    SharedMemory(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Negative errno for syscall-style returns
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::InvalidState(_) => -22, // EINVAL
            Error::OutOfMemory => -12,                                 // ENOMEM
            Error::ResourceExhausted => -24,                           // EMFILE
            Error::NotFound(_) => -9,                                  // EBADF
            Error::WouldBlock => -11,                                  // EAGAIN
            Error::Busy => -16,                                        // EBUSY
            Error::PermissionDenied => -1,                             // EPERM
            Error::Fault => -14,                                       // EFAULT
            Error::Overflow => -75,                                    // EOVERFLOW
            Error::TimedOut => -110,                                   // ETIMEDOUT
            Error::SharedMemory(_) => -5,                              // EIO
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

/// Collapse a result into a syscall-style return value
pub fn to_syscall_ret(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}
