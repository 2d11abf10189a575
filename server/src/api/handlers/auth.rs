//! Direct authentication endpoints. Each is a thin driver over the flow
//! engine: it maps the request into a flow step (initiation or
//! continuation) and returns the engine's step response.

use std::collections::HashMap;

use actix_web::{web, HttpRequest, HttpResponse};
use shared::errors::{ServiceError, ServiceResult};
use validator::Validate;

use crate::api::correlation::trace_id;
use crate::api::dto::{
    CredentialsAuthRequest, FederationFinishRequest, FederationStartRequest, OtpSendRequest,
    OtpVerifyRequest,
};
use crate::flow::{FlowStepRequest, FlowStepResponse, FlowType};
use crate::AppState;

async fn drive(
    state: &AppState,
    req: &HttpRequest,
    application_id: Option<String>,
    flow_type: Option<FlowType>,
    flow_id: Option<String>,
    inputs: HashMap<String, String>,
) -> ServiceResult<FlowStepResponse> {
    state
        .flow_engine
        .execute(FlowStepRequest {
            application_id,
            flow_type,
            flow_id,
            action_id: None,
            inputs,
            trace_id: trace_id(req),
        })
        .await
}

/// `POST /auth/credentials/authenticate`
pub async fn credentials_authenticate(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CredentialsAuthRequest>,
) -> Result<HttpResponse, ServiceError> {
    let body = body.into_inner();
    body.validate()?;

    let inputs = HashMap::from([
        ("username".to_string(), body.username),
        ("password".to_string(), body.password),
    ]);
    let response = drive(
        &state,
        &req,
        body.application_id,
        Some(FlowType::Authentication),
        body.flow_id,
        inputs,
    )
    .await?;
    Ok(HttpResponse::Ok().json(response))
}

/// `POST /auth/otp/sms/send`
pub async fn otp_sms_send(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<OtpSendRequest>,
) -> Result<HttpResponse, ServiceError> {
    let body = body.into_inner();
    body.validate()?;

    let inputs = HashMap::from([("username".to_string(), body.username)]);
    let response = drive(
        &state,
        &req,
        body.application_id,
        Some(FlowType::Authentication),
        body.flow_id,
        inputs,
    )
    .await?;
    Ok(HttpResponse::Ok().json(response))
}

/// `POST /auth/otp/sms/verify`
pub async fn otp_sms_verify(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<OtpVerifyRequest>,
) -> Result<HttpResponse, ServiceError> {
    let body = body.into_inner();
    body.validate()?;

    let inputs = HashMap::from([("otp".to_string(), body.otp)]);
    let response = drive(&state, &req, None, None, Some(body.flow_id), inputs).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// `POST /auth/oauth/{provider}/start`
///
/// The provider segment (`google`, `github`, `standard`) is informational;
/// the application's flow graph decides which federation executor runs.
pub async fn federation_start(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<FederationStartRequest>,
) -> Result<HttpResponse, ServiceError> {
    let body = body.into_inner();
    body.validate()?;

    let response = drive(
        &state,
        &req,
        Some(body.application_id),
        Some(body.flow_type.unwrap_or(FlowType::Authentication)),
        None,
        HashMap::new(),
    )
    .await?;
    Ok(HttpResponse::Ok().json(response))
}

/// `POST /auth/oauth/{provider}/finish`
pub async fn federation_finish(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<FederationFinishRequest>,
) -> Result<HttpResponse, ServiceError> {
    let body = body.into_inner();
    body.validate()?;

    let mut inputs = HashMap::from([("code".to_string(), body.code)]);
    if let Some(state_param) = body.state {
        inputs.insert("state".to_string(), state_param);
    }
    let response = drive(&state, &req, None, None, Some(body.flow_id), inputs).await?;
    Ok(HttpResponse::Ok().json(response))
}
