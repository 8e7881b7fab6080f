//! Caller-visible dispatch errors.

use crate::transport::{TransportError, TransportResponse};

/// Why one attempt failed in a way the dispatcher retries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AttemptFailure {
    #[error("quota rejected (status {status})")]
    QuotaRejected { status: u16 },
    #[error("server error (status {status})")]
    ServerError { status: u16 },
    #[error(transparent)]
    Transport(TransportError),
}

/// Terminal outcome of a dispatched request.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The retry budget ran out; carries the last failure.
    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: AttemptFailure },
    /// Credentials were rejected. The caller should refresh and resubmit.
    #[error("authentication rejected (status {})", .response.status)]
    Unauthorized { response: TransportResponse },
    /// The transport failed in a way retrying cannot fix.
    #[error("transport error: {0}")]
    Transport(TransportError),
    /// The dispatcher shut down before the request completed.
    #[error("dispatcher closed")]
    Closed,
}

impl DispatchError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, DispatchError::Unauthorized { .. })
    }

    /// HTTP status of the last response, if the failure had one.
    pub fn last_status(&self) -> Option<u16> {
        match self {
            DispatchError::RetriesExhausted { last, .. } => match last {
                AttemptFailure::QuotaRejected { status } | AttemptFailure::ServerError { status } => {
                    Some(*status)
                }
                AttemptFailure::Transport(_) => None,
            },
            DispatchError::Unauthorized { response } => Some(response.status),
            DispatchError::Transport(_) | DispatchError::Closed => None,
        }
    }
}
