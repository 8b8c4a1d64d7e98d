// error.rs — crate-wide error type.
//
// Two kinds of failure travel through the same enum:
//
//   Validation — a precondition checked on the host before anything is
//                submitted to the device. Device state is untouched, so the
//                caller can fix the input and retry.
//
//   Device     — the device layer reported a fault after submission
//                (out of memory, failed copy, rejected dispatch). Nothing is
//                retried and no partial work is rolled back.
//
// `Error::kind()` tells the two apart without matching every variant.

use crate::array::ElementType;
use crate::gpu::device::GpuError;
use crate::registry::BufferId;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected on the host before any device work was issued.
    Validation,
    /// Reported by the device layer.
    Device,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transfer size mismatch: array is {array} bytes, device buffer is {buffer} bytes")]
    SizeMismatch { array: u64, buffer: u64 },

    #[error("unknown buffer {0}: pass an explicit destination array to fetch it")]
    UnknownBuffer(BufferId),

    #[error("buffer {0} has no known element type: pass an explicit destination array to fetch it")]
    UntypedBuffer(BufferId),

    #[error("invalid buffer handle {0} (released or never allocated)")]
    InvalidHandle(BufferId),

    #[error("invalid shape: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("unsupported rank {0}: only 2-D and 3-D shapes are supported")]
    UnsupportedRank(usize),

    #[error("element type {0} has no device representation")]
    UnsupportedElementType(ElementType),

    #[error("block shape has rank {block} but the execution shape has rank {shape}")]
    RankMismatch { shape: usize, block: usize },

    #[error("block extents must be positive, got {0:?}")]
    InvalidBlock(Vec<usize>),

    #[error("scalar argument #{index} ({value}) does not fit in 32 bits")]
    ScalarOverflow { index: usize, value: i128 },

    #[error("sigma must be finite and non-negative, got {0}")]
    InvalidSigma(f64),

    #[error("no filtered result available: call filter() first")]
    NotFiltered,

    #[error("device allocation of {nbytes} bytes failed: {reason}")]
    Allocation { nbytes: u64, reason: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("releasing buffer {id} failed: {reason}")]
    Release { id: BufferId, reason: String },

    #[error("program compilation failed: {0}")]
    Compile(String),

    #[error("dispatch of `{entry}` failed: {reason}")]
    Dispatch { entry: String, reason: String },

    #[error(transparent)]
    Device(#[from] GpuError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SizeMismatch { .. }
            | Error::UnknownBuffer(_)
            | Error::UntypedBuffer(_)
            | Error::InvalidHandle(_)
            | Error::ShapeMismatch { .. }
            | Error::UnsupportedRank(_)
            | Error::UnsupportedElementType(_)
            | Error::RankMismatch { .. }
            | Error::InvalidBlock(_)
            | Error::ScalarOverflow { .. }
            | Error::InvalidSigma(_)
            | Error::NotFiltered => ErrorKind::Validation,
            Error::Allocation { .. }
            | Error::Transfer(_)
            | Error::Release { .. }
            | Error::Compile(_)
            | Error::Dispatch { .. }
            | Error::Device(_) => ErrorKind::Device,
        }
    }

    /// True when the failure was caught before device submission.
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    pub(crate) fn dispatch(entry: &str, reason: impl Into<String>) -> Self {
        Error::Dispatch {
            entry: entry.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
