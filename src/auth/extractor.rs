// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Axum extractor for optional request credentials.
//!
//! ```rust,ignore
//! async fn upload(OptionalCredential(credential): OptionalCredential) -> impl IntoResponse {
//!     // credential is Option<AuthCredential>
//! }
//! ```

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use super::{AuthCredential, CredentialError};

/// Query parameter accepted in place of the `Authorization` header.
pub const AUTH_QUERY_PARAM: &str = "auth";

/// Credential from the `Authorization` header, falling back to `?auth=`.
///
/// Absence is not an error; whether a credential is required is decided by
/// the handler. A value that is present but unparseable is rejected.
pub struct OptionalCredential(pub Option<AuthCredential>);

impl<S: Send + Sync> FromRequestParts<S> for OptionalCredential {
    type Rejection = CredentialError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .map(|value| value.to_str().map_err(|_| CredentialError::InvalidEncoding))
            .transpose()?
            .map(str::to_string);

        let raw = header.or_else(|| query_auth(parts.uri.query()));

        match raw {
            Some(value) if !value.trim().is_empty() => {
                AuthCredential::parse(&value).map(|c| OptionalCredential(Some(c)))
            }
            _ => Ok(OptionalCredential(None)),
        }
    }
}

fn query_auth(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == AUTH_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credential::{encode_header, NostrEvent};
    use axum::http::Request;

    fn event() -> NostrEvent {
        NostrEvent {
            id: "evt".into(),
            pubkey: "abc".into(),
            kind: 24242,
            created_at: 0,
            tags: vec![vec!["size".into(), "3".into()]],
            content: String::new(),
        }
    }

    async fn extract(request: Request<()>) -> Result<OptionalCredential, CredentialError> {
        let (mut parts, _) = request.into_parts();
        OptionalCredential::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_header() {
        let request = Request::builder()
            .uri("/upload")
            .header(AUTHORIZATION, encode_header(&event()))
            .body(())
            .unwrap();
        let OptionalCredential(credential) = extract(request).await.unwrap();
        assert_eq!(credential.unwrap().size, Some(3));
    }

    #[tokio::test]
    async fn falls_back_to_query() {
        let json = serde_json::to_string(&event()).unwrap();
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(AUTH_QUERY_PARAM, &json)
            .finish();
        let request = Request::builder()
            .uri(format!("/upload?{query}"))
            .body(())
            .unwrap();
        let OptionalCredential(credential) = extract(request).await.unwrap();
        assert_eq!(credential.unwrap().id, "evt");
    }

    #[tokio::test]
    async fn absent_is_none_and_garbage_is_rejected() {
        let request = Request::builder().uri("/list").body(()).unwrap();
        assert!(extract(request).await.unwrap().0.is_none());

        let request = Request::builder()
            .uri("/list")
            .header(AUTHORIZATION, "Bearer token")
            .body(())
            .unwrap();
        assert!(extract(request).await.is_err());
    }
}
