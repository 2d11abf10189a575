//! Health endpoints for monitors and orchestrators.

use actix_web::{web, HttpResponse};
use shared::database;

use crate::api::dto::HealthResponse;
use crate::AppState;

/// `GET /health/liveness`: the process is up.
pub async fn liveness() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse { status: "alive" })
}

/// `GET /health/readiness`: every datasource answers a trivial query.
pub async fn readiness(state: web::Data<AppState>) -> HttpResponse {
    let sources = &state.datasources;
    let checks = futures::join!(
        database::health_check(&sources.identity),
        database::health_check(&sources.runtime),
        database::health_check(&sources.user),
    );
    match checks {
        (Ok(()), Ok(()), Ok(())) => HttpResponse::Ok().json(HealthResponse { status: "ready" }),
        _ => HttpResponse::ServiceUnavailable().json(HealthResponse { status: "degraded" }),
    }
}
