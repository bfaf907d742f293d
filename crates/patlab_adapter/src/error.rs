#![forbid(unsafe_code)]

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use patlab_kernel_contracts::submission::SubmissionAck;
use patlab_kernel_contracts::ContractViolation;
use patlab_storage::submissions::StorageError;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Invalid JSON data")]
    InvalidJson,

    #[error("Missing required fields: participantId or condition")]
    MissingRequiredFields,

    #[error("Invalid value for {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },

    #[error("Database error")]
    Database(#[source] StorageError),

    #[error("Internal error")]
    Internal(String),
}

impl From<ContractViolation> for AppError {
    fn from(violation: ContractViolation) -> Self {
        match violation {
            ContractViolation::MissingField { .. } => AppError::MissingRequiredFields,
            ContractViolation::InvalidValue {
                field: "submission_payload",
                ..
            } => AppError::InvalidJson,
            ContractViolation::InvalidValue { field, reason } => {
                AppError::InvalidField { field, reason }
            }
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ContractViolation(v) => v.into(),
            other => AppError::Database(other),
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::InvalidJson
            | AppError::MissingRequiredFields
            | AppError::InvalidField { .. } => StatusCode::BAD_REQUEST,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(err) => error!(error = %err, "submission insert failed"),
            AppError::Internal(reason) => error!(reason = %reason, "adapter internal error"),
            _ => {}
        }
        let status = self.status();
        (status, Json(SubmissionAck::failed(self.to_string()))).into_response()
    }
}
