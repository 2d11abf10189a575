//! Request/response DTOs for the HTTP surface. Request bodies are validated
//! with the `validator` derive before they reach the service layer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::flow::FlowType;

// =============================================================================
// Flow Execution
// =============================================================================

/// Body of `POST /flow/execute`: an initiation (`application_id` +
/// `flow_type`) or a continuation (`flow_id` + inputs).
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct FlowExecuteRequest {
    pub application_id: Option<String>,
    pub flow_type: Option<FlowType>,
    pub flow_id: Option<String>,
    pub action_id: Option<String>,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

// =============================================================================
// Direct Authentication Endpoints
// =============================================================================

/// Body of `POST /auth/credentials/authenticate`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CredentialsAuthRequest {
    pub application_id: Option<String>,
    pub flow_id: Option<String>,
    #[validate(length(min = 1))]
    pub username: String,
    #[validate(length(min = 1))]
    pub password: String,
}

/// Body of `POST /auth/otp/sms/send`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct OtpSendRequest {
    pub application_id: Option<String>,
    pub flow_id: Option<String>,
    #[validate(length(min = 1))]
    pub username: String,
}

/// Body of `POST /auth/otp/sms/verify`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct OtpVerifyRequest {
    #[validate(length(min = 1))]
    pub flow_id: String,
    #[validate(length(min = 4, max = 10))]
    pub otp: String,
}

/// Body of `POST /auth/oauth/{provider}/start`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct FederationStartRequest {
    #[validate(length(min = 1))]
    pub application_id: String,
    pub flow_type: Option<FlowType>,
}

/// Body of `POST /auth/oauth/{provider}/finish`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct FederationFinishRequest {
    #[validate(length(min = 1))]
    pub flow_id: String,
    #[validate(length(min = 1))]
    pub code: String,
    pub state: Option<String>,
}

// =============================================================================
// OAuth2 Endpoints
// =============================================================================

/// Form body of `POST /oauth2/token`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenForm {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub assertion: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Query of `GET /oauth2/authorize`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeQuery {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    /// A completed-flow assertion finishing the authorization round-trip.
    pub assertion: Option<String>,
}

/// Form body of `POST /oauth2/introspect`.
#[derive(Debug, Clone, Deserialize)]
pub struct IntrospectForm {
    pub token: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

// =============================================================================
// User CRUD
// =============================================================================

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UserRequest {
    #[serde(rename = "type", default = "default_user_type")]
    pub user_type: String,
    pub ou_handle: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Value,
    pub password: Option<String>,
}

fn default_user_type() -> String {
    "person".to_string()
}

// =============================================================================
// Application CRUD
// =============================================================================

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApplicationRequest {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub client_id: String,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub grant_types: Vec<String>,
    #[validate(length(min = 1))]
    pub token_auth_methods: Vec<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub scope_claims: serde_json::Value,
    #[serde(default)]
    pub id_token_user_attributes: Vec<String>,
    pub auth_flow_id: Option<String>,
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_execute_accepts_initiations_and_continuations() {
        let initiation: FlowExecuteRequest = serde_json::from_str(
            r#"{"application_id": "app-1", "flow_type": "AUTHENTICATION"}"#,
        )
        .unwrap();
        assert_eq!(initiation.flow_type, Some(FlowType::Authentication));
        assert!(initiation.inputs.is_empty());

        let continuation: FlowExecuteRequest = serde_json::from_str(
            r#"{"flow_id": "f-1", "inputs": {"otp": "123456"}}"#,
        )
        .unwrap();
        assert_eq!(continuation.inputs["otp"], "123456");
    }

    #[test]
    fn credentials_request_requires_non_empty_fields() {
        let request = CredentialsAuthRequest {
            application_id: Some("app-1".into()),
            flow_id: None,
            username: "".into(),
            password: "hunter2".into(),
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn token_form_parses_urlencoded_bodies() {
        let form: TokenForm = serde_urlencoded::from_str(
            "grant_type=authorization_code&code=abc&redirect_uri=https%3A%2F%2Fapp.example%2Fcb",
        )
        .unwrap();
        assert_eq!(form.grant_type, "authorization_code");
        assert_eq!(form.code.as_deref(), Some("abc"));
        assert!(form.client_id.is_none());
    }
}
