//! Flow assertions: the signed token binding a completed flow to an
//! application, exchanged for OAuth tokens at the token endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use shared::crypto::JwtService;
use shared::errors::{ServiceError, ServiceResult};
use uuid::Uuid;

use crate::flow::engine::AssertionIssuer;

use super::{Executor, ExecutorResponse, NodeContext};

/// How long an unexchanged assertion stays valid.
const ASSERTION_VALIDITY_SECONDS: i64 = 300;

// =============================================================================
// Assertion Service
// =============================================================================

/// Mints and verifies flow assertions. Used by the `auth_assert` executor,
/// by the engine when a flow terminates without one, and by the token
/// endpoint when exchanging.
#[derive(Clone)]
pub struct AssertionService {
    jwt: Arc<JwtService>,
}

/// The verified binding inside an assertion.
#[derive(Debug, Clone)]
pub struct AssertionClaims {
    pub app_id: String,
    pub flow_id: String,
    pub user_id: String,
    pub authenticated_at: i64,
}

impl AssertionService {
    pub fn new(jwt: Arc<JwtService>) -> Self {
        Self { jwt }
    }

    /// Signs an assertion binding `(app_id, flow_id, user_id,
    /// authenticated_at)`.
    pub fn mint(&self, app_id: &str, flow_id: &str, user_id: &str) -> ServiceResult<String> {
        let now = Utc::now().timestamp();
        self.jwt.sign(&json!({
            "iss": self.jwt.issuer(),
            "sub": user_id,
            "aud": app_id,
            "flow_id": flow_id,
            "authenticated_at": now,
            "iat": now,
            "nbf": now,
            "exp": now + ASSERTION_VALIDITY_SECONDS,
            "jti": Uuid::new_v4().to_string(),
            "token_use": "flow_assertion",
        }))
    }

    /// Verifies an assertion presented by `client_app_id` and returns its
    /// binding.
    pub fn verify(&self, assertion: &str, client_app_id: &str) -> ServiceResult<AssertionClaims> {
        let claims = self
            .jwt
            .verify(assertion, Some(client_app_id), Some(self.jwt.issuer()))
            .map_err(|_| ServiceError::invalid_grant("assertion is invalid or expired"))?;

        if claims.get("token_use").and_then(|v| v.as_str()) != Some("flow_assertion") {
            return Err(ServiceError::invalid_grant("token is not a flow assertion"));
        }

        let field = |name: &str| -> ServiceResult<String> {
            claims
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| ServiceError::invalid_grant(format!("assertion lacks {}", name)))
        };

        Ok(AssertionClaims {
            app_id: field("aud")?,
            flow_id: field("flow_id")?,
            user_id: field("sub")?,
            authenticated_at: claims
                .get("authenticated_at")
                .and_then(|v| v.as_i64())
                .unwrap_or_default(),
        })
    }
}

impl AssertionIssuer for AssertionService {
    fn issue(&self, app_id: &str, flow_id: &str, user_id: &str) -> ServiceResult<String> {
        self.mint(app_id, flow_id, user_id)
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Terminal-on-success executor producing the flow's assertion.
pub struct AuthAssertExecutor {
    assertions: AssertionService,
}

impl AuthAssertExecutor {
    pub fn new(assertions: AssertionService) -> Self {
        Self { assertions }
    }
}

#[async_trait]
impl Executor for AuthAssertExecutor {
    fn name(&self) -> &'static str {
        "auth_assert"
    }

    async fn execute(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
        let Some(user_id) = ctx
            .authenticated_user
            .as_ref()
            .filter(|u| u.is_authenticated)
            .and_then(|u| u.user_id.clone())
        else {
            return Ok(ExecutorResponse::failure(
                "cannot assert an unauthenticated flow",
            ));
        };

        let assertion = self.assertions.mint(&ctx.app_id, &ctx.flow_id, &user_id)?;
        Ok(ExecutorResponse::complete().with_assertion(assertion))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::context::{AuthenticatedUser, FlowType};
    use crate::flow::executors::ExecutorStatus;
    use std::collections::HashMap;

    fn service() -> AssertionService {
        AssertionService::new(Arc::new(JwtService::from_secret(
            "unit-test-secret-0123456789-0123456789",
            "https://thunder.test",
        )))
    }

    #[test]
    fn mint_verify_roundtrip_binds_all_fields() {
        let svc = service();
        let assertion = svc.mint("app-1", "flow-9", "user-7").unwrap();
        let claims = svc.verify(&assertion, "app-1").unwrap();
        assert_eq!(claims.app_id, "app-1");
        assert_eq!(claims.flow_id, "flow-9");
        assert_eq!(claims.user_id, "user-7");
        assert!(claims.authenticated_at > 0);
    }

    #[test]
    fn assertion_is_rejected_for_a_different_client() {
        let svc = service();
        let assertion = svc.mint("app-1", "flow-9", "user-7").unwrap();
        let err = svc.verify(&assertion, "other-app").unwrap_err();
        assert_eq!(err.code, "invalid_grant");
    }

    #[test]
    fn ordinary_access_tokens_are_not_assertions() {
        let svc = service();
        let jwt = JwtService::from_secret(
            "unit-test-secret-0123456789-0123456789",
            "https://thunder.test",
        );
        let token = jwt
            .sign(&serde_json::json!({
                "iss": "https://thunder.test",
                "sub": "user-7",
                "aud": "app-1",
                "exp": Utc::now().timestamp() + 300,
            }))
            .unwrap();
        let err = svc.verify(&token, "app-1").unwrap_err();
        assert!(err.description.contains("not a flow assertion"));
    }

    #[tokio::test]
    async fn executor_asserts_authenticated_flows_only() {
        let executor = AuthAssertExecutor::new(service());
        let mut ctx = NodeContext {
            flow_id: "flow-9".into(),
            flow_type: FlowType::Authentication,
            app_id: "app-1".into(),
            node_id: "assert".into(),
            properties: serde_json::Map::new(),
            inputs: HashMap::new(),
            runtime_data: HashMap::new(),
            authenticated_user: None,
            trace_id: "trace-1".into(),
        };

        let response = executor.execute(&ctx).await.unwrap();
        assert_eq!(response.status(), ExecutorStatus::Failure);

        ctx.authenticated_user = Some(AuthenticatedUser::authenticated("user-7"));
        let response = executor.execute(&ctx).await.unwrap();
        assert_eq!(response.status(), ExecutorStatus::Complete);
        assert!(response.assertion.is_some());
    }
}
