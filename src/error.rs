//! Status codes and the crate-wide error type.
//!
//! Errors in batchflow carry a stable [`Code`] alongside a human-readable
//! message. The code is what survives a checkpoint round trip: the
//! map-and-batch codec persists a failed batch's status as an integer code
//! plus message and rebuilds an equivalent [`Error`] on restore, so the
//! same failure surfaces to the consumer after recovery.

use serde::{Deserialize, Serialize};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error classification.
///
/// The numeric representation is part of the checkpoint format; variants
/// must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum Code {
    /// A caller-supplied argument or configuration value is invalid.
    InvalidArgument = 1,
    /// An operation ran past the end of the valid input range.
    OutOfRange = 2,
    /// The iterator was torn down while the operation was pending.
    Cancelled = 3,
    /// An internal invariant was violated.
    Internal = 4,
    /// Failure with no more specific classification.
    Unknown = 5,
}

impl Code {
    /// Decode a code previously written to a checkpoint.
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(Code::InvalidArgument),
            2 => Some(Code::OutOfRange),
            3 => Some(Code::Cancelled),
            4 => Some(Code::Internal),
            5 => Some(Code::Unknown),
            _ => None,
        }
    }
}

/// The crate error: a [`Code`] plus message.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    code: Code,
    message: String,
}

impl Error {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(Code::OutOfRange, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// First-non-OK-wins status accumulation.
///
/// Batch slots collect the status of every call that contributes to the
/// batch; once a call has failed, later results (including later
/// failures) do not overwrite the recorded error.
pub fn update_status(current: &mut Result<()>, incoming: Result<()>) {
    if current.is_ok() {
        if let Err(e) = incoming {
            *current = Err(e);
        }
    }
}
