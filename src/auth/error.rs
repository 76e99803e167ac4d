// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Credential errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Reasons a presented credential cannot be used.
#[derive(Debug)]
pub enum CredentialError {
    /// Header is neither `Nostr <base64>` nor a JSON event
    InvalidEncoding,
    /// Decoded but not a usable event
    MalformedEvent(String),
    /// Validity window has passed
    Expired,
}

#[derive(Serialize)]
struct CredentialErrorBody {
    error: String,
    error_code: String,
}

impl CredentialError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CredentialError::InvalidEncoding => "invalid_auth_header",
            CredentialError::MalformedEvent(_) => "invalid_credential",
            CredentialError::Expired => "credential_expired",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialError::InvalidEncoding => write!(
                f,
                "Invalid authorization header format (expected 'Nostr <base64 event>')"
            ),
            CredentialError::MalformedEvent(msg) => write!(f, "Invalid credential: {msg}"),
            CredentialError::Expired => write!(f, "Credential has expired"),
        }
    }
}

impl std::error::Error for CredentialError {}

impl IntoResponse for CredentialError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(CredentialErrorBody {
            error: self.to_string(),
            error_code: self.error_code().to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn invalid_encoding_returns_401() {
        let response = CredentialError::InvalidEncoding.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(body["error_code"], "invalid_auth_header");
    }

    #[tokio::test]
    async fn expired_credential_code() {
        let response = CredentialError::Expired.into_response();
        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(body["error_code"], "credential_expired");
    }
}
