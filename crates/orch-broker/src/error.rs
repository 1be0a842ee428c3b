//! Broker error kinds with their stable codes and HTTP statuses.

use serde_json::{Value, json};
use thiserror::Error;

use orch_core::{CredentialType, InvalidInput};
use orch_runtime::RuntimeError;
use orch_state::StateError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        value: String,
        message: String,
    },

    #[error("resource {id} not found")]
    NotFound { id: String },

    #[error("resource {id} is already checked out by {holder}")]
    Conflict { id: String, holder: String },

    #[error("cannot identify a container for {ip}")]
    CannotIdentify { ip: String },

    #[error("resource {id} is not checked out by {container_id}")]
    NotHeld { id: String, container_id: String },

    #[error("failed to create {credential_type} {name}: {reason}")]
    CreationFailed {
        credential_type: CredentialType,
        name: String,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(#[from] StateError),

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl From<InvalidInput> for BrokerError {
    fn from(e: InvalidInput) -> Self {
        Self::Validation {
            field: e.field,
            value: e.value,
            message: e.message,
        }
    }
}

impl BrokerError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::Conflict { .. } => "RESOURCE_ALREADY_CHECKED_OUT",
            Self::CannotIdentify { .. } => "CONTAINER_NOT_FOUND",
            Self::NotHeld { .. } => "RESOURCE_NOT_HELD",
            Self::CreationFailed { .. } => "RESOURCE_CREATION_FAILED",
            Self::Store(_) => "DATABASE_ERROR",
            Self::Runtime(_) => "CONTAINER_CLIENT_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::CannotIdentify { .. } | Self::NotHeld { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::CreationFailed { .. } | Self::Store(_) | Self::Runtime(_) | Self::Internal(_) => {
                500
            }
        }
    }

    /// Structured context for the error body.
    pub fn details(&self) -> Value {
        match self {
            Self::Validation { field, value, .. } => json!({ "field": field, "value": value }),
            Self::NotFound { id } => json!({ "resource_id": id }),
            Self::Conflict { id, holder } => json!({ "resource_id": id, "holder": holder }),
            Self::CannotIdentify { ip } => json!({ "client_ip": ip }),
            Self::NotHeld { id, container_id } => {
                json!({ "resource_id": id, "container_id": container_id })
            }
            Self::CreationFailed {
                credential_type,
                name,
                reason,
            } => json!({
                "resource_type": credential_type,
                "resource_name": name,
                "reason": reason,
            }),
            Self::Store(_) | Self::Runtime(_) | Self::Internal(_) => json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses() {
        let cases = [
            (BrokerError::NotFound { id: "x".into() }, "RESOURCE_NOT_FOUND", 404),
            (
                BrokerError::Conflict {
                    id: "x".into(),
                    holder: "c1".into(),
                },
                "RESOURCE_ALREADY_CHECKED_OUT",
                409,
            ),
            (
                BrokerError::CannotIdentify { ip: "10.0.0.1".into() },
                "CONTAINER_NOT_FOUND",
                400,
            ),
            (
                BrokerError::NotHeld {
                    id: "x".into(),
                    container_id: "c".into(),
                },
                "RESOURCE_NOT_HELD",
                400,
            ),
            (
                BrokerError::Store(StateError::Read("disk".into())),
                "DATABASE_ERROR",
                500,
            ),
            (
                BrokerError::Runtime(RuntimeError::Connect("gone".into())),
                "CONTAINER_CLIENT_ERROR",
                500,
            ),
            (BrokerError::Internal("boom".into()), "INTERNAL_ERROR", 500),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status_code(), status);
        }
    }

    #[test]
    fn validation_from_invalid_input() {
        let err: BrokerError = InvalidInput::new("id", "a:b", "bad").into();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.details()["field"], "id");
        assert_eq!(err.details()["value"], "a:b");
    }

    #[test]
    fn creation_failure_details() {
        let err = BrokerError::CreationFailed {
            credential_type: CredentialType::Worker,
            name: "koji-worker-1".into(),
            reason: "kadmin timed out".into(),
        };
        let details = err.details();
        assert_eq!(details["resource_type"], "worker");
        assert_eq!(details["resource_name"], "koji-worker-1");
    }
}
