//! Typed errors returned to callers of the pipeline.

use thiserror::Error;

use crate::open_files::AdvisoryLock;

/// Why a capability was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("capability is not valid (timed out)")]
    Expired,
    #[error("capability is not valid (invalid signature)")]
    BadSignature,
    #[error("capability was issued for another file than the one requested")]
    WrongFile,
    #[error("capability does not grant the requested access mode")]
    InsufficientMode,
}

/// Why a request's replica view was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ViewRejection {
    #[error("request is based on an outdated view ({request} < {current})")]
    Outdated { request: u64, current: u64 },
    #[error("replica has been invalidated at view {current}")]
    Invalidated { current: u64 },
}

/// POSIX errno class reported to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    None,
    Einval,
    Eacces,
    Eagain,
    Eio,
    Enoent,
    Ebusy,
}

/// Error category reported to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Errno,
    InvalidView,
    Overloaded,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OsdError {
    #[error("stage overloaded ({depth} requests queued)")]
    Overloaded { depth: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    InvalidCapability(#[from] CapabilityError),
    #[error(transparent)]
    InvalidView(#[from] ViewRejection),
    #[error("conflicting lock held by {}:{} ({}+{})", .0.owner.client_uuid, .0.owner.pid, .0.offset, .0.length)]
    LockConflict(AdvisoryLock),
    #[error("file {0} is not open")]
    NotOpen(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("lease coordinator error: {0}")]
    Lease(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("stage terminated")]
    StageTerminated,
}

impl OsdError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::Overloaded { .. } => Errno::Eagain,
            Self::InvalidArgument(_) => Errno::Einval,
            Self::InvalidCapability(_) => Errno::Eacces,
            Self::InvalidView(_) => Errno::None,
            Self::LockConflict(_) => Errno::Eagain,
            Self::NotOpen(_) => Errno::Enoent,
            Self::Io(_) | Self::Lease(_) | Self::Internal(_) => Errno::Eio,
            Self::StageTerminated => Errno::Ebusy,
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Overloaded { .. } => ErrorType::Overloaded,
            Self::InvalidView(_) => ErrorType::InvalidView,
            Self::Io(_) | Self::Lease(_) | Self::Internal(_) | Self::StageTerminated => {
                ErrorType::Internal
            }
            _ => ErrorType::Errno,
        }
    }
}

/// Outcome of an operation handler that did not succeed.
#[derive(Debug)]
pub enum HandlerFailure {
    /// Business error, returned to the caller; the stage keeps running.
    Rejected(OsdError),
    /// Programmer error; logged and terminates the stage.
    Fault(anyhow::Error),
}

impl From<OsdError> for HandlerFailure {
    fn from(err: OsdError) -> Self {
        Self::Rejected(err)
    }
}
