use crate::internal::step::error::StepError;
use thiserror::Error;

/// Coarse classification of an error, used by callers to decide between
/// "keep the request pending" and "reject it".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resources are busy right now, the same request may succeed later.
    Retryable,
    /// The request can never be satisfied by this job.
    Permanent,
    /// An internal invariant was violated.
    Internal,
    /// Input data (wire blob, state file) is truncated or inconsistent.
    Malformed,
}

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum JobResError {
    #[error(transparent)]
    StepError(#[from] StepError),
    #[error("Invalid resource layout: {0}")]
    LayoutError(String),
    #[error("Malformed data: {0}")]
    UnpackError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Error: {0}")]
    GenericError(String),
}

impl JobResError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobResError::StepError(e) if e.is_retryable() => ErrorKind::Retryable,
            JobResError::StepError(_) => ErrorKind::Permanent,
            JobResError::LayoutError(_) => ErrorKind::Internal,
            JobResError::UnpackError(_) => ErrorKind::Malformed,
            JobResError::IoError(_) | JobResError::GenericError(_) => ErrorKind::Internal,
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    pub fn as_step_error(&self) -> Option<&StepError> {
        match self {
            JobResError::StepError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<String> for JobResError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

impl From<&str> for JobResError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}

/// Creates a layout error and reports it, layout errors always mean a broken invariant.
pub(crate) fn layout_error(message: String) -> JobResError {
    log::error!("{message}");
    JobResError::LayoutError(message)
}

pub(crate) fn unpack_error(message: String) -> JobResError {
    log::debug!("Unpack failed: {message}");
    JobResError::UnpackError(message)
}
