// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Ok,
    Unavailable,
}

impl From<bool> for ComponentStatus {
    fn from(ok: bool) -> Self {
        if ok {
            Self::Ok
        } else {
            Self::Unavailable
        }
    }
}

/// Per-component check results.
#[derive(Debug, Serialize, ToSchema)]
pub struct ComponentChecks {
    /// Storage backend name ("local" or "s3").
    pub backend: &'static str,
    /// Read-only reachability check of the backend.
    pub storage: ComponentStatus,
    pub metadata: ComponentStatus,
    /// Staging directory under `DATA_DIR`.
    pub staging: ComponentStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReadinessReport {
    /// "ok" when every component is available, otherwise "degraded".
    pub status: &'static str,
    pub checks: ComponentChecks,
    /// Resolution sources in waterfall order.
    pub sources: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LivenessReport {
    pub status: &'static str,
    pub version: &'static str,
}

/// Read-only checks; nothing here writes or scans.
async fn check_components(state: &AppState) -> (bool, ReadinessReport) {
    let checks = ComponentChecks {
        backend: state.storage.name(),
        storage: state.storage.check().await.is_ok().into(),
        metadata: state.metadata.check().is_ok().into(),
        staging: tokio::fs::metadata(state.config.staging_dir())
            .await
            .is_ok_and(|m| m.is_dir())
            .into(),
    };
    let ready = [checks.storage, checks.metadata, checks.staging]
        .iter()
        .all(|c| *c == ComponentStatus::Ok);

    let report = ReadinessReport {
        status: if ready { "ok" } else { "degraded" },
        checks,
        sources: state.resolver.sources().iter().map(ToString::to_string).collect(),
    };
    (ready, report)
}

/// Full component report. 503 when anything is unavailable.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "All components available", body = ReadinessReport),
        (status = 503, description = "At least one component unavailable", body = ReadinessReport)
    )
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<ReadinessReport>) {
    let (ready, report) = check_components(&state).await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

#[utoipa::path(
    get,
    path = "/health/live",
    tag = "Health",
    responses((status = 200, description = "Process is running", body = LivenessReport))
)]
pub async fn liveness() -> Json<LivenessReport> {
    Json(LivenessReport {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Same checks as `/health`; kept separate for orchestrators that expect it.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "Health",
    responses(
        (status = 200, description = "Ready to serve blobs", body = ReadinessReport),
        (status = 503, description = "Not ready", body = ReadinessReport)
    )
)]
pub async fn readiness(state: State<AppState>) -> (StatusCode, Json<ReadinessReport>) {
    health(state).await
}
