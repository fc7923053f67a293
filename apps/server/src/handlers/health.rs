use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ServiceChecks {
    pub database: &'static str,
    pub email: &'static str,
    pub auth: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub services: ServiceChecks,
}

/// GET /api/health — 503 when the database is unreachable or auth is unconfigured
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let db_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let auth_ok = state.config.auth_configured();
    let healthy = db_ok && auth_ok;

    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        services: ServiceChecks {
            database: if db_ok { "ok" } else { "error" },
            email: if state.mailer.enabled() {
                "configured"
            } else {
                "not_configured"
            },
            auth: if auth_ok { "configured" } else { "not_configured" },
        },
    };

    if !healthy {
        tracing::warn!("health check failed: db_ok={} auth_ok={}", db_ok, auth_ok);
    }
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
