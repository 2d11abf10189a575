//! Application CRUD endpoints.

use actix_web::{web, HttpResponse};
use shared::errors::ServiceError;
use uuid::Uuid;
use validator::Validate;

use crate::api::dto::ApplicationRequest;
use crate::service::ApplicationUpsert;
use crate::AppState;

fn to_upsert(body: ApplicationRequest) -> ApplicationUpsert {
    ApplicationUpsert {
        name: body.name,
        client_id: body.client_id,
        client_secret: body.client_secret,
        grant_types: body.grant_types,
        token_auth_methods: body.token_auth_methods,
        redirect_uris: body.redirect_uris,
        scopes: body.scopes,
        scope_claims: body.scope_claims,
        id_token_user_attributes: body.id_token_user_attributes,
        auth_flow_id: body.auth_flow_id,
    }
}

/// `POST /applications`
pub async fn create(
    state: web::Data<AppState>,
    body: web::Json<ApplicationRequest>,
) -> Result<HttpResponse, ServiceError> {
    let body = body.into_inner();
    body.validate()?;
    let app = state.applications.create(to_upsert(body)).await?;
    Ok(HttpResponse::Created().json(app))
}

/// `GET /applications`
pub async fn list(state: web::Data<AppState>) -> Result<HttpResponse, ServiceError> {
    let apps = state.applications.list().await?;
    Ok(HttpResponse::Ok().json(apps))
}

/// `GET /applications/{id}`
pub async fn get(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let app = state.applications.get(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(app))
}

/// `PUT /applications/{id}`
pub async fn update(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<ApplicationRequest>,
) -> Result<HttpResponse, ServiceError> {
    let body = body.into_inner();
    body.validate()?;
    let app = state
        .applications
        .update(path.into_inner(), to_upsert(body))
        .await?;
    Ok(HttpResponse::Ok().json(app))
}

/// `DELETE /applications/{id}`
pub async fn delete(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    state.applications.delete(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}
