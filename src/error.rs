// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::auth::CredentialError;
use crate::resolver::ResolveError;
use crate::storage::{MetadataError, StorageError};
use crate::upload::UploadError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub error_code: &'static str,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_code: &'static str,
}

impl ApiError {
    pub fn new(status: StatusCode, error_code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error_code,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn forbidden(error_code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, error_code, message)
    }

    pub fn unauthorized(error_code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, error_code, message)
    }

    /// Log the cause and return an opaque 500.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        error!(error = %cause, "Internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            error_code: self.error_code,
        });
        (self.status, body).into_response()
    }
}

impl From<CredentialError> for ApiError {
    fn from(e: CredentialError) -> Self {
        Self::new(e.status_code(), e.error_code(), e.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(hash) => Self::not_found(format!("Blob {hash} not found")),
            other => Self::internal(other),
        }
    }
}

impl From<MetadataError> for ApiError {
    fn from(e: MetadataError) -> Self {
        Self::internal(e)
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NotFound(hash) => Self::not_found(format!("Blob {hash} not found")),
            ResolveError::StorageUnavailable(e) => Self::internal(e),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        let message = e.to_string();
        match e {
            UploadError::UploadsDisabled => Self::forbidden("uploads_disabled", message),
            UploadError::AuthRequired => Self::unauthorized("auth_required", message),
            UploadError::CredentialExpired => Self::unauthorized("credential_expired", message),
            UploadError::CredentialReused => Self::forbidden("credential_reused", message),
            UploadError::NoMatchingRule(_) => Self::forbidden("no_matching_rule", message),
            UploadError::SizeMismatch { .. } => Self::forbidden("size_mismatch", message),
            UploadError::TooLarge { .. } => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, "too_large", message)
            }
            UploadError::Body(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_body", message),
            UploadError::Staging(e) => Self::internal(e),
            UploadError::Storage(e) => Self::from(e),
            UploadError::Metadata(e) => Self::internal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlobHash;
    use crate::rules::NoMatchingRule;
    use axum::body::to_bytes;

    #[test]
    fn upload_errors_map_to_statuses() {
        let cases = [
            (UploadError::UploadsDisabled, StatusCode::FORBIDDEN),
            (UploadError::AuthRequired, StatusCode::UNAUTHORIZED),
            (UploadError::CredentialExpired, StatusCode::UNAUTHORIZED),
            (UploadError::CredentialReused, StatusCode::FORBIDDEN),
            (
                UploadError::NoMatchingRule(NoMatchingRule { mime_type: None }),
                StatusCode::FORBIDDEN,
            ),
            (
                UploadError::SizeMismatch {
                    declared: Some(100),
                    actual: 80,
                },
                StatusCode::FORBIDDEN,
            ),
            (UploadError::TooLarge { limit: 1 }, StatusCode::PAYLOAD_TOO_LARGE),
            (
                UploadError::Storage(StorageError::Unavailable("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status, status);
        }
    }

    #[test]
    fn resolve_not_found_is_404() {
        let err = ApiError::from(ResolveError::NotFound(BlobHash::of(b"x")));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.error_code, "not_found");
    }

    #[tokio::test]
    async fn into_response_returns_json_body() {
        let response = ApiError::forbidden("size_mismatch", "bad size").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert_eq!(body, r#"{"error":"bad size","error_code":"size_mismatch"}"#);
    }
}
