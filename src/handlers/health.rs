use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{db, AppState};

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthStatus {
    pub status: &'static str,
    pub database: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

#[utoipa::path(
    get,
    path = "/api/v1/health",
    summary = "Health check",
    responses(
        (status = 200, description = "Service healthy", body = HealthStatus),
        (status = 503, description = "Database unreachable", body = HealthStatus),
    ),
    tag = "Health"
)]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let database_ok = db::check_connection(&state.db).await.is_ok();
    let status = HealthStatus {
        status: if database_ok { "healthy" } else { "unhealthy" },
        database: if database_ok { "up" } else { "down" },
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    let code = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}
