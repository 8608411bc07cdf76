use std::time::Duration;

use thiserror::Error;

/// Why an enhancement attempt for one item did not produce a display change.
#[derive(Debug, Clone, Error)]
pub enum EnhanceError {
    /// Connection, timeout or 5xx talking to the backend.
    #[error("backend unreachable: {0}")]
    Transient(String),
    /// The backend answered but reported a failure (`X-MU-Host-Error` or 4xx).
    #[error("backend error: {0}")]
    HostError(String),
    /// The result could not be decoded by any path.
    #[error("decode failed: {0}")]
    Decode(String),
    /// Rejected before reaching the backend.
    #[error("cooling down for {}ms", remaining.as_millis())]
    CoolingDown { remaining: Duration },
    /// Transport or cache contract violation.
    #[error("integrity error: {0}")]
    Integrity(String),
    /// Every render strategy was rejected by the display side.
    #[error("render rejected: {0}")]
    Render(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Transient,
    Soft,
    Decode,
    Integrity,
}

impl EnhanceError {
    /// Backoff bucket for the per-item `failed-until` window.  `None` for
    /// cooldown rejections, which are not failures.
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            EnhanceError::Transient(_) => Some(FailureCategory::Transient),
            EnhanceError::HostError(_) | EnhanceError::Render(_) => Some(FailureCategory::Soft),
            EnhanceError::Decode(_) => Some(FailureCategory::Decode),
            EnhanceError::Integrity(_) => Some(FailureCategory::Integrity),
            EnhanceError::CoolingDown { .. } => None,
        }
    }

    pub fn is_cooldown(&self) -> bool {
        matches!(self, EnhanceError::CoolingDown { .. })
    }
}

/// Failure of a lifecycle operation.  Cloneable so that every caller joined
/// on a single-flight start receives the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("backend did not become healthy after {attempts} health checks")]
    StartTimedOut { attempts: u32 },
    #[error("lifecycle manager dropped")]
    Gone,
}

impl From<LifecycleError> for EnhanceError {
    fn from(e: LifecycleError) -> Self {
        EnhanceError::Transient(e.to_string())
    }
}
