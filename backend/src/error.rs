//! Unified error handling for the briefcase backend.

use crate::config::ConfigError;
use crate::database::DatabaseError;
use crate::hub::HubError;
use briefcase_engine::{Code, Lock};
use std::sync::Arc;

/// Resources the hub would not grant.
///
/// Codes are authoritative: this error is raised whenever any requested code
/// is unavailable, and lists the locks that were denied alongside.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "{} code(s) and {} lock(s) are unavailable",
    .unavailable_codes.len(),
    .unavailable_locks.len()
)]
pub struct RequestError {
    pub unavailable_codes: Vec<Code>,
    pub unavailable_locks: Vec<Lock>,
}

/// Backend error type.
///
/// `Clone` so one failed open can be delivered to every coalesced caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Engine error: {0}")]
    Engine(#[from] briefcase_engine::Error),

    #[error("Hub error: {0}")]
    Hub(HubError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Superseded: {0}")]
    Superseded(String),

    #[error("Resource request failed: {0}")]
    ResourceRequest(#[from] RequestError),
}

impl BackendError {
    pub fn state(message: impl Into<String>) -> Self {
        BackendError::State(message.into())
    }

    /// The hub error behind this one, if any.
    pub fn hub_error(&self) -> Option<&HubError> {
        match self {
            BackendError::Hub(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HubError> for BackendError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::Unauthorized(msg) => BackendError::Authentication(msg),
            HubError::NotFound(msg) => BackendError::NotFound(msg),
            other => BackendError::Hub(other),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(Arc::new(e))
    }
}

/// Result type alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_errors_map_to_categories() {
        assert!(matches!(
            BackendError::from(HubError::Unauthorized("expired".into())),
            BackendError::Authentication(_)
        ));
        assert!(matches!(
            BackendError::from(HubError::NotFound("imodel".into())),
            BackendError::NotFound(_)
        ));
        let conflict = BackendError::from(HubError::PullIsRequired);
        assert_eq!(conflict.hub_error(), Some(&HubError::PullIsRequired));
    }

    #[test]
    fn request_error_lists_counts() {
        let err = RequestError {
            unavailable_codes: vec![Code::new("0x1d", "0x1", "Pump-1")],
            unavailable_locks: vec![],
        };
        assert_eq!(err.to_string(), "1 code(s) and 0 lock(s) are unavailable");
    }
}
