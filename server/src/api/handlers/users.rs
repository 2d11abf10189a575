//! User CRUD endpoints over the identity store.

use actix_web::{web, HttpResponse};
use shared::errors::ServiceError;
use uuid::Uuid;
use validator::Validate;

use crate::api::dto::UserRequest;
use crate::service::UserUpsert;
use crate::AppState;

fn to_upsert(body: UserRequest) -> UserUpsert {
    UserUpsert {
        ou_handle: body.ou_handle,
        user_type: body.user_type,
        attributes: body.attributes,
        password: body.password,
    }
}

/// `POST /users`
pub async fn create(
    state: web::Data<AppState>,
    body: web::Json<UserRequest>,
) -> Result<HttpResponse, ServiceError> {
    let body = body.into_inner();
    body.validate()?;
    let user = state.users.create_user(to_upsert(body)).await?;
    Ok(HttpResponse::Created().json(user))
}

/// `GET /users/{id}`
pub async fn get(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let user = state.users.get_user(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(user))
}

/// `PUT /users/{id}`
pub async fn update(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<UserRequest>,
) -> Result<HttpResponse, ServiceError> {
    let body = body.into_inner();
    body.validate()?;
    let user = state
        .users
        .update_user(path.into_inner(), to_upsert(body))
        .await?;
    Ok(HttpResponse::Ok().json(user))
}

/// `DELETE /users/{id}`
pub async fn delete(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    state.users.delete_user(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}
