//! # Client Authentication
//!
//! Authenticates OAuth2 client applications from request material.
//!
//! ## Method resolution
//!
//! | Credentials present                      | Method resolved        |
//! |------------------------------------------|------------------------|
//! | `Authorization: Basic …` only            | `client_secret_basic`  |
//! | Form `client_id` + `client_secret`       | `client_secret_post`   |
//! | Form `client_id` only                    | `none`                 |
//! | Both header and body credentials         | reject `invalid_request` |
//! | No `client_id` anywhere                  | reject `invalid_client`  |
//!
//! The resolved method must be on the application's allow-list, and unless
//! the method is `none` the secret must verify against the stored verifier.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use shared::crypto::CredentialHasher;
use shared::errors::{ServiceError, ServiceResult};
use shared::observability::{Event, EventBus, EventStatus};
use tracing::debug;

use crate::domain::Application;

// =============================================================================
// Method & Credentials
// =============================================================================

/// Token-endpoint client authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
    None,
}

impl ClientAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientSecretBasic => "client_secret_basic",
            Self::ClientSecretPost => "client_secret_post",
            Self::None => "none",
        }
    }
}

/// Credentials extracted from one request, before validation.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub method: ClientAuthMethod,
}

/// Resolves the authentication method from the request material.
pub fn extract_credentials(
    authorization_header: Option<&str>,
    form_client_id: Option<&str>,
    form_client_secret: Option<&str>,
) -> ServiceResult<ClientCredentials> {
    let basic = authorization_header
        .and_then(|h| h.strip_prefix("Basic "))
        .map(str::trim);

    let form_id = form_client_id.filter(|s| !s.is_empty());
    let form_secret = form_client_secret.filter(|s| !s.is_empty());

    match (basic, form_id, form_secret) {
        // Credentials in two places is always malformed.
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(ServiceError::invalid_request(
            "client credentials must not appear in both the header and the body",
        )),
        (Some(encoded), None, None) => {
            let decoded = BASE64
                .decode(encoded)
                .map_err(|_| ServiceError::invalid_request("malformed Basic authorization"))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| ServiceError::invalid_request("malformed Basic authorization"))?;
            let (client_id, client_secret) = decoded
                .split_once(':')
                .ok_or_else(|| ServiceError::invalid_request("malformed Basic authorization"))?;
            if client_id.is_empty() {
                return Err(ServiceError::invalid_client("missing client_id"));
            }
            Ok(ClientCredentials {
                client_id: client_id.to_string(),
                client_secret: Some(client_secret.to_string()),
                method: ClientAuthMethod::ClientSecretBasic,
            })
        }
        (None, Some(client_id), Some(client_secret)) => Ok(ClientCredentials {
            client_id: client_id.to_string(),
            client_secret: Some(client_secret.to_string()),
            method: ClientAuthMethod::ClientSecretPost,
        }),
        (None, Some(client_id), None) => Ok(ClientCredentials {
            client_id: client_id.to_string(),
            client_secret: None,
            method: ClientAuthMethod::None,
        }),
        (None, None, _) => Err(ServiceError::invalid_client("missing client_id")),
    }
}

// =============================================================================
// Service
// =============================================================================

/// Application lookup seam, implemented by the application service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApplicationLookup: Send + Sync {
    async fn by_client_id(&self, client_id: &str) -> ServiceResult<Option<Application>>;
}

pub struct ClientAuthService<L> {
    applications: Arc<L>,
    hasher: Arc<CredentialHasher>,
    bus: EventBus,
}

impl<L: ApplicationLookup> ClientAuthService<L> {
    pub fn new(applications: Arc<L>, hasher: Arc<CredentialHasher>, bus: EventBus) -> Self {
        Self { applications, hasher, bus }
    }

    /// Validates extracted credentials and returns the client application.
    pub async fn authenticate(
        &self,
        credentials: ClientCredentials,
        trace_id: &str,
    ) -> ServiceResult<Application> {
        let app = self
            .applications
            .by_client_id(&credentials.client_id)
            .await?
            .ok_or_else(|| ServiceError::invalid_client("unknown client"))?;

        if !app.allows_auth_method(credentials.method.as_str()) {
            // A client that tried `none` without being public is missing its
            // secret, not using a disallowed method.
            if credentials.method == ClientAuthMethod::None {
                return Err(ServiceError::invalid_client("client secret required"));
            }
            return Err(ServiceError::unauthorized_client(format!(
                "auth method {} not allowed for this client",
                credentials.method.as_str()
            )));
        }

        if credentials.method != ClientAuthMethod::None {
            let secret = credentials
                .client_secret
                .as_deref()
                .ok_or_else(|| ServiceError::invalid_client("client secret required"))?;
            let verifier = app
                .client_secret_hash
                .as_deref()
                .ok_or_else(|| ServiceError::invalid_client("client has no secret configured"))?;
            if !self.hasher.verify(secret, verifier)? {
                return Err(ServiceError::invalid_client("client authentication failed"));
            }
        }

        debug!(client_id = %app.client_id, method = credentials.method.as_str(), "client authenticated");
        self.bus.publish(
            Event::new("oauth.client.authenticated", "client-auth")
                .with_trace_id(trace_id)
                .with_status(EventStatus::Success)
                .with_data(serde_json::json!({
                    "client_id": app.client_id,
                    "method": credentials.method.as_str(),
                })),
        );
        Ok(app)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn basic(id: &str, secret: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:{}", id, secret)))
    }

    #[test]
    fn basic_header_resolves_client_secret_basic() {
        let creds =
            extract_credentials(Some(&basic("app-1", "s3cret")), None, None).unwrap();
        assert_eq!(creds.method, ClientAuthMethod::ClientSecretBasic);
        assert_eq!(creds.client_id, "app-1");
        assert_eq!(creds.client_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn form_credentials_resolve_client_secret_post() {
        let creds = extract_credentials(None, Some("app-1"), Some("s3cret")).unwrap();
        assert_eq!(creds.method, ClientAuthMethod::ClientSecretPost);
    }

    #[test]
    fn form_client_id_alone_resolves_none() {
        let creds = extract_credentials(None, Some("app-1"), None).unwrap();
        assert_eq!(creds.method, ClientAuthMethod::None);
        assert!(creds.client_secret.is_none());
    }

    #[test]
    fn credentials_in_both_places_are_rejected_as_invalid_request() {
        let err = extract_credentials(
            Some(&basic("app-1", "s3cret")),
            Some("app-1"),
            Some("s3cret"),
        )
        .unwrap_err();
        assert_eq!(err.code, "invalid_request");

        // Header plus form client_id alone is just as malformed.
        let err =
            extract_credentials(Some(&basic("app-1", "s3cret")), Some("app-1"), None).unwrap_err();
        assert_eq!(err.code, "invalid_request");
    }

    #[test]
    fn missing_client_id_is_invalid_client() {
        let err = extract_credentials(None, None, None).unwrap_err();
        assert_eq!(err.code, "invalid_client");
    }

    #[test]
    fn malformed_basic_header_is_invalid_request() {
        assert_eq!(
            extract_credentials(Some("Basic !!!"), None, None).unwrap_err().code,
            "invalid_request"
        );
        let no_colon = format!("Basic {}", BASE64.encode("just-an-id"));
        assert_eq!(
            extract_credentials(Some(&no_colon), None, None).unwrap_err().code,
            "invalid_request"
        );
    }

    // ------------------------------------------------------------------
    // Service-level checks
    // ------------------------------------------------------------------

    struct OneApp {
        app: Application,
    }

    #[async_trait]
    impl ApplicationLookup for OneApp {
        async fn by_client_id(&self, client_id: &str) -> ServiceResult<Option<Application>> {
            Ok((client_id == self.app.client_id).then(|| self.app.clone()))
        }
    }

    fn service(methods: Vec<&str>, secret: Option<&str>) -> ClientAuthService<OneApp> {
        let hasher = Arc::new(CredentialHasher::new());
        let app = Application {
            id: Uuid::new_v4(),
            name: "Test".into(),
            client_id: "app-1".into(),
            client_secret_hash: secret.map(|s| hasher.hash(s).unwrap()),
            grant_types: vec!["authorization_code".into()],
            token_auth_methods: methods.into_iter().map(String::from).collect(),
            redirect_uris: vec![],
            scopes: vec![],
            scope_claims: json!({}),
            id_token_user_attributes: vec![],
            auth_flow_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        ClientAuthService::new(Arc::new(OneApp { app }), hasher, EventBus::new())
    }

    #[tokio::test]
    async fn valid_secret_authenticates() {
        let svc = service(vec!["client_secret_basic"], Some("s3cret"));
        let creds = extract_credentials(Some(&basic("app-1", "s3cret")), None, None).unwrap();
        let app = svc.authenticate(creds, "trace-1").await.unwrap();
        assert_eq!(app.client_id, "app-1");
    }

    #[tokio::test]
    async fn wrong_secret_is_invalid_client() {
        let svc = service(vec!["client_secret_basic"], Some("s3cret"));
        let creds = extract_credentials(Some(&basic("app-1", "wrong")), None, None).unwrap();
        let err = svc.authenticate(creds, "trace-1").await.unwrap_err();
        assert_eq!(err.code, "invalid_client");
    }

    #[tokio::test]
    async fn unknown_client_is_invalid_client() {
        let svc = service(vec!["client_secret_basic"], Some("s3cret"));
        let creds = extract_credentials(Some(&basic("ghost", "s3cret")), None, None).unwrap();
        let err = svc.authenticate(creds, "trace-1").await.unwrap_err();
        assert_eq!(err.code, "invalid_client");
    }

    #[tokio::test]
    async fn disallowed_method_is_unauthorized_client() {
        let svc = service(vec!["client_secret_basic"], Some("s3cret"));
        let creds = extract_credentials(None, Some("app-1"), Some("s3cret")).unwrap();
        let err = svc.authenticate(creds, "trace-1").await.unwrap_err();
        assert_eq!(err.code, "unauthorized_client");
    }

    #[tokio::test]
    async fn none_without_public_listing_is_missing_secret() {
        let svc = service(vec!["client_secret_basic"], Some("s3cret"));
        let creds = extract_credentials(None, Some("app-1"), None).unwrap();
        let err = svc.authenticate(creds, "trace-1").await.unwrap_err();
        assert_eq!(err.code, "invalid_client");
        assert!(err.description.contains("secret required"));
    }

    #[tokio::test]
    async fn public_client_authenticates_with_none() {
        let svc = service(vec!["none"], None);
        let creds = extract_credentials(None, Some("app-1"), None).unwrap();
        let app = svc.authenticate(creds, "trace-1").await.unwrap();
        assert!(app.is_public());
    }

    #[tokio::test]
    async fn lookup_failures_propagate_as_server_errors() {
        let mut lookup = MockApplicationLookup::new();
        lookup
            .expect_by_client_id()
            .returning(|_| Err(ServiceError::server("SRV-1000", "database error")));
        let svc = ClientAuthService::new(
            Arc::new(lookup),
            Arc::new(CredentialHasher::new()),
            EventBus::new(),
        );
        let creds = extract_credentials(None, Some("app-1"), Some("s3cret")).unwrap();
        let err = svc.authenticate(creds, "trace-1").await.unwrap_err();
        assert!(err.is_server_error());
    }
}
