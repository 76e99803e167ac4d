// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};
use utoipa::IntoParams;

use crate::{
    auth::OptionalCredential,
    discovery::BlobSearch,
    error::ApiError,
    models::{BlobDescriptor, BlobHash},
    state::AppState,
};

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct PubkeyQuery {
    /// Hex pubkey used as a discovery hint or list filter.
    pub pubkey: Option<String>,
}

impl PubkeyQuery {
    fn normalized(&self) -> Option<String> {
        self.pubkey
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_ascii_lowercase)
    }
}

/// Split `{sha256}[.ext]` into its hash and optional extension.
///
/// Anything that is not a 64 hex character hash yields `None`.
pub fn parse_blob_path(file: &str) -> Option<(BlobHash, Option<String>)> {
    let (stem, ext) = match file.split_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (file, None),
    };
    let hash = stem.parse().ok()?;
    let ext = ext
        .filter(|e| !e.is_empty())
        .map(str::to_ascii_lowercase);
    Some((hash, ext))
}

#[utoipa::path(
    get,
    path = "/{file}",
    params(
        ("file" = String, Path, description = "Blob hash with an optional extension"),
        PubkeyQuery
    ),
    tag = "Blobs",
    responses(
        (status = 200, description = "Blob bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Blob not found anywhere")
    )
)]
pub async fn get_blob(
    Path(file): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<PubkeyQuery>,
) -> Result<Response, ApiError> {
    let Some((hash, ext)) = parse_blob_path(&file) else {
        return Err(ApiError::not_found(format!("'{file}' is not a blob address")));
    };

    let mut search = BlobSearch::new(hash);
    search.ext = ext;
    search.pubkey = query.normalized();

    let blob = state.resolver.resolve(&search).await?;
    debug!(hash = %blob.hash, source = %blob.source, "Serving blob");

    let mut response = Body::from_stream(blob.body).into_response();
    let headers = response.headers_mut();
    let content_type = HeaderValue::from_str(&blob.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Some(size) = blob.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    Ok(response)
}

#[utoipa::path(
    put,
    path = "/upload",
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    tag = "Blobs",
    responses(
        (status = 200, body = BlobDescriptor),
        (status = 401, description = "Missing, invalid or expired credential"),
        (status = 403, description = "Upload rejected by policy"),
        (status = 413, description = "Payload exceeds the configured limit")
    )
)]
pub async fn upload_blob(
    State(state): State<AppState>,
    OptionalCredential(credential): OptionalCredential,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<BlobDescriptor>, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let record = state
        .uploads
        .accept(body.into_data_stream(), content_type, credential.as_ref())
        .await?;

    info!(hash = %record.hash, size = record.size, "Blob uploaded");
    Ok(Json(state.descriptor(&record)))
}

#[utoipa::path(
    get,
    path = "/list",
    params(PubkeyQuery),
    tag = "Blobs",
    responses(
        (status = 200, body = [BlobDescriptor]),
        (status = 401, description = "Credential required or expired"),
        (status = 403, description = "Listing another pubkey is not allowed")
    )
)]
pub async fn list_blobs(
    State(state): State<AppState>,
    OptionalCredential(credential): OptionalCredential,
    Query(query): Query<PubkeyQuery>,
) -> Result<Json<Vec<BlobDescriptor>>, ApiError> {
    let policy = &state.config.list;

    if policy.require_auth && credential.is_none() {
        return Err(ApiError::unauthorized(
            "auth_required",
            "A credential is required to list blobs",
        ));
    }
    if let Some(credential) = &credential {
        credential.ensure_valid(Utc::now().timestamp())?;
    }

    let own = credential.as_ref().map(|c| c.pubkey.as_str());
    let filter = query.normalized();
    let filter = if policy.allow_list_others {
        filter
    } else {
        match (filter, own) {
            (Some(filter), Some(own)) if filter == own => Some(filter),
            (None, Some(own)) => Some(own.to_string()),
            _ => {
                return Err(ApiError::new(
                    StatusCode::FORBIDDEN,
                    "list_forbidden",
                    "Listing blobs of another pubkey is not allowed",
                ))
            }
        }
    };

    let records = state.metadata.list_blobs(filter.as_deref())?;
    Ok(Json(records.iter().map(|r| state.descriptor(r)).collect()))
}
