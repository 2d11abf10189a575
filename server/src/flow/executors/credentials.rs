//! Credentials executor: username/password verification.

use async_trait::async_trait;
use shared::errors::{ErrorKind, ServiceError, ServiceResult};

use crate::domain::User;
use crate::flow::context::AuthenticatedUser;

use super::{Executor, ExecutorResponse, NodeContext};

/// Credential verification seam, implemented by the user service.
#[async_trait]
pub trait CredentialsAuth: Send + Sync {
    /// Verifies a username/password pair against the stored verifier.
    /// Unknown users and wrong passwords both surface as the same
    /// client-kind error to prevent enumeration.
    async fn verify_credentials(&self, username: &str, password: &str) -> ServiceResult<User>;
}

pub struct CredentialsExecutor<A: CredentialsAuth> {
    auth: std::sync::Arc<A>,
}

impl<A: CredentialsAuth> CredentialsExecutor<A> {
    pub fn new(auth: std::sync::Arc<A>) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl<A: CredentialsAuth + 'static> Executor for CredentialsExecutor<A> {
    fn name(&self) -> &'static str {
        "credentials"
    }

    fn default_inputs(&self) -> &'static [&'static str] {
        &["username", "password"]
    }

    async fn execute(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
        let (Some(username), Some(password)) = (ctx.input("username"), ctx.input("password"))
        else {
            return Ok(ExecutorResponse::user_input_required(vec![
                "username".into(),
                "password".into(),
            ]));
        };

        match self.auth.verify_credentials(username, password).await {
            Ok(user) => {
                let mut authenticated = AuthenticatedUser::authenticated(user.id.to_string());
                authenticated
                    .attributes
                    .insert("username".into(), username.to_string());
                if let Some(email) = user.attribute("email") {
                    authenticated.attributes.insert("email".into(), email.to_string());
                }
                Ok(ExecutorResponse::complete().with_authenticated_user(authenticated))
            }
            Err(e) if e.kind == ErrorKind::Client || e.kind == ErrorKind::NotFound => {
                Ok(ExecutorResponse::failure(e.description))
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::context::FlowType;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Arc;
    use uuid::Uuid;

    struct StubAuth {
        user: User,
    }

    #[async_trait]
    impl CredentialsAuth for StubAuth {
        async fn verify_credentials(&self, username: &str, password: &str) -> ServiceResult<User> {
            if username == "alice" && password == "hunter2" {
                Ok(self.user.clone())
            } else {
                Err(ServiceError::client("CRD-1001", "invalid username or password"))
            }
        }
    }

    fn node_ctx(inputs: &[(&str, &str)]) -> NodeContext {
        NodeContext {
            flow_id: "flow-1".into(),
            flow_type: FlowType::Authentication,
            app_id: "app-1".into(),
            node_id: "creds".into(),
            properties: serde_json::Map::new(),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            runtime_data: HashMap::new(),
            authenticated_user: None,
            trace_id: "trace-1".into(),
        }
    }

    fn executor() -> CredentialsExecutor<StubAuth> {
        let user = User {
            id: Uuid::new_v4(),
            ou_id: Uuid::new_v4(),
            user_type: "person".into(),
            attributes: serde_json::json!({"username": "alice", "email": "alice@example.com"}),
            credential_hash: Some("$argon2id$...".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        CredentialsExecutor::new(Arc::new(StubAuth { user }))
    }

    #[tokio::test]
    async fn missing_inputs_request_them() {
        let response = executor().execute(&node_ctx(&[])).await.unwrap();
        assert_eq!(response.status(), super::super::ExecutorStatus::UserInputRequired);
        assert!(response.required_data.contains(&"password".to_string()));
    }

    #[tokio::test]
    async fn valid_credentials_authenticate_the_user() {
        let response = executor()
            .execute(&node_ctx(&[("username", "alice"), ("password", "hunter2")]))
            .await
            .unwrap();
        assert_eq!(response.status(), super::super::ExecutorStatus::Complete);
        let user = response.authenticated_user.unwrap();
        assert!(user.is_authenticated);
        assert_eq!(user.attributes.get("email").map(String::as_str), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn wrong_password_fails_the_node_with_reason() {
        let response = executor()
            .execute(&node_ctx(&[("username", "alice"), ("password", "wrong")]))
            .await
            .unwrap();
        assert_eq!(response.status(), super::super::ExecutorStatus::Failure);
        assert_eq!(
            response.failure_reason.as_deref(),
            Some("invalid username or password")
        );
    }
}
