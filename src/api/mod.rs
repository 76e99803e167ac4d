// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{get, put},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{models::BlobDescriptor, state::AppState};

pub mod blobs;
pub mod health;

pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/upload", put(blobs::upload_blob))
        .route("/list", get(blobs::list_blobs))
        .route("/{file}", get(blobs::get_blob))
        .with_state(state);

    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        blobs::get_blob,
        blobs::upload_blob,
        blobs::list_blobs,
        health::health,
        health::liveness,
        health::readiness
    ),
    components(
        schemas(
            BlobDescriptor,
            health::ReadinessReport,
            health::ComponentChecks,
            health::ComponentStatus,
            health::LivenessReport
        )
    ),
    tags(
        (name = "Blobs", description = "Content-addressed blob retrieval, upload and listing"),
        (name = "Health", description = "Liveness and readiness checks")
    )
)]
struct ApiDoc;
