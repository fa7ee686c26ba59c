use crate::models::{ProviderRole, TransferState};
use thiserror::Error;

/// Every failure a transfer operation can surface. Callers branch on the
/// variant to pick a corrective action: re-authorize, retry later, or fix
/// the input.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{0} provider is not authorized")]
    Unauthorized(ProviderRole),

    #[error("an authorization attempt is already pending for the {0} provider")]
    AlreadyPending(ProviderRole),

    #[error("no {0} session exists")]
    NotSupported(ProviderRole),

    #[error("{provider} provider unavailable: {reason}")]
    UpstreamUnavailable { provider: ProviderRole, reason: String },

    #[error("folder {0} is not in the most recently fetched folder list")]
    InvalidFolder(usize),

    #[error("playlist name must not be blank")]
    EmptyName,

    #[error("no report has been built yet")]
    ReportNotFound,

    #[error("transfer run is {actual}, expected {expected}")]
    InvalidState {
        expected: TransferState,
        actual: TransferState,
    },

    #[error("authorization for the {0} provider timed out")]
    AuthorizationTimedOut(ProviderRole),

    #[error("{provider} authorization callback rejected: {reason}")]
    CallbackRejected { provider: ProviderRole, reason: String },

    #[error("token store error: {0}")]
    Storage(String),
}

impl TransferError {
    pub fn upstream(provider: ProviderRole, reason: impl std::fmt::Display) -> Self {
        TransferError::UpstreamUnavailable {
            provider,
            reason: reason.to_string(),
        }
    }

    pub fn callback(provider: ProviderRole, reason: impl std::fmt::Display) -> Self {
        TransferError::CallbackRejected {
            provider,
            reason: reason.to_string(),
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        TransferError::Storage(err.to_string())
    }

    /// True when the provider session is missing or expired and the caller
    /// should restart authorization rather than retry.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransferError::Unauthorized(_))
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, TransferError::UpstreamUnavailable { .. })
    }

    /// Provider the error is attributed to, if any.
    pub fn provider(&self) -> Option<ProviderRole> {
        match self {
            TransferError::Unauthorized(p)
            | TransferError::AlreadyPending(p)
            | TransferError::NotSupported(p)
            | TransferError::AuthorizationTimedOut(p) => Some(*p),
            TransferError::UpstreamUnavailable { provider, .. }
            | TransferError::CallbackRejected { provider, .. } => Some(*provider),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
