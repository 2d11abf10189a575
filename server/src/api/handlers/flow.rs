//! Flow-execution endpoint: the single entry point graph-driven clients
//! use to initiate and continue flows.

use actix_web::{web, HttpRequest, HttpResponse};
use shared::errors::ServiceError;

use crate::api::correlation::trace_id;
use crate::api::dto::FlowExecuteRequest;
use crate::flow::FlowStepRequest;
use crate::AppState;

/// `POST /flow/execute`
pub async fn execute(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<FlowExecuteRequest>,
) -> Result<HttpResponse, ServiceError> {
    let body = body.into_inner();
    let response = state
        .flow_engine
        .execute(FlowStepRequest {
            application_id: body.application_id,
            flow_type: body.flow_type,
            flow_id: body.flow_id,
            action_id: body.action_id,
            inputs: body.inputs,
            trace_id: trace_id(&req),
        })
        .await?;
    Ok(HttpResponse::Ok().json(response))
}
