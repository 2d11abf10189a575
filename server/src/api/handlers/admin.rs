//! Admin surface for the MCP toolset: lists the typed tools and dispatches
//! calls. An external MCP transport fronts these in production; the HTTP
//! form keeps the registry reachable for operators and tests.

use actix_web::{web, HttpResponse};
use shared::errors::ServiceError;

use crate::AppState;

/// `GET /admin/mcp/tools`
pub async fn list_tools(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.mcp_tools.list())
}

/// `POST /admin/mcp/tools/{name}`
pub async fn call_tool(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, ServiceError> {
    let result = state
        .mcp_tools
        .call(&path.into_inner(), body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(result))
}
