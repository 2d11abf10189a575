//! Federated login executors: generic OAuth2/OIDC plus the Google and
//! GitHub specializations.
//!
//! Two-phase: phase 1 builds the authorize URL with a fresh `state` (and,
//! for OIDC, `nonce`) and returns an external redirection; phase 2 consumes
//! the received `code`, exchanges it at the IdP, validates `nonce` against
//! the stored value, extracts the federated subject, and resolves a local
//! user.
//!
//! In authentication flows a missing local user fails the node; in
//! registration flows it succeeds with `sub` placed in the runtime data for
//! downstream provisioning.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use serde::Deserialize;
use shared::crypto::JwtService;
use shared::errors::{ServiceError, ServiceResult};
use url::Url;

use crate::domain::User;
use crate::flow::context::{AuthenticatedUser, FlowType};

use super::{Executor, ExecutorResponse, NodeContext};

/// ID-token claims that are protocol plumbing, not user attributes.
const NON_USER_CLAIMS: [&str; 14] = [
    "iss", "aud", "exp", "iat", "nbf", "nonce", "at_hash", "c_hash", "azp", "sid", "jti",
    "auth_time", "acr", "amr",
];

// =============================================================================
// Seams
// =============================================================================

/// Local-user resolution by federated subject, implemented by the user
/// service (matching on the `sub:<idp>` attribute).
#[async_trait]
pub trait FederatedUserResolver: Send + Sync {
    async fn find_by_subject(&self, idp: &str, subject: &str) -> ServiceResult<Option<User>>;
}

// =============================================================================
// Provider Defaults
// =============================================================================

/// Endpoint defaults a named provider ships with; node properties override
/// every field (tests point them at a stub server).
#[derive(Debug, Clone, Default)]
struct ProviderDefaults {
    authorization_endpoint: &'static str,
    token_endpoint: &'static str,
    userinfo_endpoint: &'static str,
    scopes: &'static str,
    /// Whether the provider issues OIDC ID tokens.
    oidc: bool,
    /// Field of the userinfo document holding the subject when no ID token
    /// is issued (GitHub's numeric `id`).
    subject_field: &'static str,
}

// =============================================================================
// Executor
// =============================================================================

pub struct OidcExecutor<R> {
    name: &'static str,
    defaults: ProviderDefaults,
    http: reqwest::Client,
    users: Arc<R>,
}

impl<R: FederatedUserResolver> OidcExecutor<R> {
    /// Generic OIDC federation; all endpoints come from node properties.
    pub fn standard(http: reqwest::Client, users: Arc<R>) -> Self {
        Self {
            name: "oidc",
            defaults: ProviderDefaults {
                scopes: "openid profile email",
                oidc: true,
                subject_field: "sub",
                ..Default::default()
            },
            http,
            users,
        }
    }

    pub fn google(http: reqwest::Client, users: Arc<R>) -> Self {
        Self {
            name: "google_oidc",
            defaults: ProviderDefaults {
                authorization_endpoint: "https://accounts.google.com/o/oauth2/v2/auth",
                token_endpoint: "https://oauth2.googleapis.com/token",
                userinfo_endpoint: "https://openidconnect.googleapis.com/v1/userinfo",
                scopes: "openid profile email",
                oidc: true,
                subject_field: "sub",
            },
            http,
            users,
        }
    }

    pub fn github(http: reqwest::Client, users: Arc<R>) -> Self {
        Self {
            name: "github_oauth",
            defaults: ProviderDefaults {
                authorization_endpoint: "https://github.com/login/oauth/authorize",
                token_endpoint: "https://github.com/login/oauth/access_token",
                userinfo_endpoint: "https://api.github.com/user",
                scopes: "read:user user:email",
                oidc: false,
                subject_field: "id",
            },
            http,
            users,
        }
    }

    fn property(&self, ctx: &NodeContext, key: &str, fallback: &str) -> String {
        ctx.property_str(key).unwrap_or(fallback).to_string()
    }

    fn start_redirect(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
        let endpoint = self.property(ctx, "authorization_endpoint", self.defaults.authorization_endpoint);
        let client_id = ctx.property_str("client_id").ok_or_else(|| {
            ServiceError::server("FED-1001", "federation node is missing client_id")
        })?;
        let redirect_uri = ctx.property_str("redirect_uri").ok_or_else(|| {
            ServiceError::server("FED-1001", "federation node is missing redirect_uri")
        })?;
        let scopes = self.property(ctx, "scopes", self.defaults.scopes);

        let state = random_token();
        let mut url = Url::parse(&endpoint)
            .map_err(|e| ServiceError::server("FED-1002", format!("bad authorization endpoint: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &scopes)
            .append_pair("state", &state);

        let mut response = ExecutorResponse::external_redirect(url.as_str())
            .with_runtime_data("state", state);
        if self.defaults.oidc {
            let nonce = random_token();
            url.query_pairs_mut().append_pair("nonce", &nonce);
            response.redirect_url = Some(url.into());
            response = response.with_runtime_data("nonce", nonce);
        }
        Ok(response)
    }

    async fn finish(&self, ctx: &NodeContext, code: &str) -> ServiceResult<ExecutorResponse> {
        // The round-trip state must match what phase 1 stored.
        let expected_state = ctx.runtime("state");
        if expected_state.is_some() && ctx.input("state") != expected_state {
            return Ok(ExecutorResponse::failure("state parameter mismatch"));
        }

        let tokens = match self.exchange_code(ctx, code).await? {
            Ok(tokens) => tokens,
            Err(reason) => return Ok(ExecutorResponse::failure(reason)),
        };

        let (subject, mut claims) = match self.federated_identity(ctx, &tokens).await? {
            Ok(identity) => identity,
            Err(reason) => return Ok(ExecutorResponse::failure(reason)),
        };

        // Scopes beyond the ID token's content pull from UserInfo.
        let scopes = self.property(ctx, "scopes", self.defaults.scopes);
        let userinfo_endpoint = self.property(ctx, "userinfo_endpoint", self.defaults.userinfo_endpoint);
        if self.defaults.oidc
            && !userinfo_endpoint.is_empty()
            && (scopes.contains("profile") || scopes.contains("email"))
        {
            if let Ok(extra) = self.fetch_userinfo(&userinfo_endpoint, &tokens.access_token).await {
                for (key, value) in extra {
                    claims.entry(key).or_insert(value);
                }
            }
        }

        match self.users.find_by_subject(self.name, &subject).await? {
            Some(user) => {
                let mut authenticated = AuthenticatedUser::authenticated(user.id.to_string());
                authenticated.attributes.extend(claims);
                Ok(ExecutorResponse::complete().with_authenticated_user(authenticated))
            }
            None if ctx.flow_type == FlowType::Registration => {
                let mut response = ExecutorResponse::complete().with_runtime_data("sub", subject);
                for (key, value) in claims {
                    response.runtime_data.insert(key, value);
                }
                Ok(response)
            }
            None => Ok(ExecutorResponse::failure(
                "no local user for the federated identity",
            )),
        }
    }

    async fn exchange_code(
        &self,
        ctx: &NodeContext,
        code: &str,
    ) -> ServiceResult<Result<TokenResponse, String>> {
        let endpoint = self.property(ctx, "token_endpoint", self.defaults.token_endpoint);
        let client_id = ctx.property_str("client_id").unwrap_or_default().to_string();
        let client_secret = ctx.property_str("client_secret").unwrap_or_default().to_string();
        let redirect_uri = ctx.property_str("redirect_uri").unwrap_or_default().to_string();

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &redirect_uri),
            ("client_id", &client_id),
            ("client_secret", &client_secret),
        ];

        let response = self
            .http
            .post(&endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| ServiceError::server("FED-1003", format!("token exchange failed: {}", e)))?;

        if !response.status().is_success() {
            return Ok(Err(format!(
                "token exchange rejected with status {}",
                response.status().as_u16()
            )));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::server("FED-1004", format!("bad token response: {}", e)))?;
        Ok(Ok(tokens))
    }

    /// Extracts `(subject, user claims)` from the ID token or, for plain
    /// OAuth providers, the userinfo document.
    async fn federated_identity(
        &self,
        ctx: &NodeContext,
        tokens: &TokenResponse,
    ) -> ServiceResult<Result<(String, HashMap<String, String>), String>> {
        if self.defaults.oidc {
            let Some(id_token) = &tokens.id_token else {
                return Ok(Err("identity provider returned no ID token".to_string()));
            };
            let (_, payload) = JwtService::decode_unverified(id_token)?;

            // OIDC replay protection: the nonce must round-trip.
            if let Some(expected) = ctx.runtime("nonce") {
                if payload.get("nonce").and_then(|v| v.as_str()) != Some(expected) {
                    return Ok(Err("nonce mismatch in ID token".to_string()));
                }
            }

            let Some(subject) = payload.get("sub").and_then(|v| v.as_str()) else {
                return Ok(Err("ID token has no sub claim".to_string()));
            };
            return Ok(Ok((subject.to_string(), harvest_claims(&payload))));
        }

        let endpoint = self.property(ctx, "userinfo_endpoint", self.defaults.userinfo_endpoint);
        let profile = self.fetch_userinfo_raw(&endpoint, &tokens.access_token).await?;
        let Some(subject) = profile
            .get(self.defaults.subject_field)
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        else {
            return Ok(Err(format!(
                "userinfo document has no {} field",
                self.defaults.subject_field
            )));
        };
        Ok(Ok((subject, harvest_claims(&profile))))
    }

    async fn fetch_userinfo(
        &self,
        endpoint: &str,
        access_token: &str,
    ) -> ServiceResult<HashMap<String, String>> {
        let profile = self.fetch_userinfo_raw(endpoint, access_token).await?;
        Ok(harvest_claims(&profile))
    }

    async fn fetch_userinfo_raw(
        &self,
        endpoint: &str,
        access_token: &str,
    ) -> ServiceResult<serde_json::Value> {
        self.http
            .get(endpoint)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, "thunder")
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ServiceError::server("FED-1005", format!("userinfo request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| ServiceError::server("FED-1006", format!("bad userinfo response: {}", e)))
    }
}

#[async_trait]
impl<R: FederatedUserResolver + 'static> Executor for OidcExecutor<R> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
        match ctx.input("code") {
            Some(code) => {
                let code = code.to_string();
                self.finish(ctx, &code).await
            }
            None => self.start_redirect(ctx),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
}

/// Flattens a claims document into string attributes, dropping protocol
/// claims and nested structures' nulls.
fn harvest_claims(payload: &serde_json::Value) -> HashMap<String, String> {
    let mut claims = HashMap::new();
    if let serde_json::Value::Object(map) = payload {
        for (key, value) in map {
            if NON_USER_CLAIMS.contains(&key.as_str()) || value.is_null() {
                continue;
            }
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            claims.insert(key.clone(), rendered);
        }
    }
    claims
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::executors::ExecutorStatus;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StubResolver {
        known: Mutex<HashMap<String, User>>,
    }

    impl StubResolver {
        fn empty() -> Arc<Self> {
            Arc::new(Self { known: Mutex::new(HashMap::new()) })
        }

        fn with_user(subject: &str) -> (Arc<Self>, Uuid) {
            let user = User {
                id: Uuid::new_v4(),
                ou_id: Uuid::new_v4(),
                user_type: "person".into(),
                attributes: json!({}),
                credential_hash: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            let id = user.id;
            let resolver = Self {
                known: Mutex::new(HashMap::from([(subject.to_string(), user)])),
            };
            (Arc::new(resolver), id)
        }
    }

    #[async_trait]
    impl FederatedUserResolver for StubResolver {
        async fn find_by_subject(&self, _idp: &str, subject: &str) -> ServiceResult<Option<User>> {
            Ok(self.known.lock().unwrap().get(subject).cloned())
        }
    }

    /// A syntactically valid, unsigned compact JWS; phase 2 only decodes it.
    fn fake_id_token(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&json!({"alg": "RS256"})).unwrap());
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let signature = URL_SAFE_NO_PAD.encode(b"sig");
        format!("{}.{}.{}", header, payload, signature)
    }

    fn node_ctx(
        flow_type: FlowType,
        properties: serde_json::Value,
        inputs: &[(&str, &str)],
        runtime: &[(&str, &str)],
    ) -> NodeContext {
        NodeContext {
            flow_id: "flow-fed".into(),
            flow_type,
            app_id: "app-1".into(),
            node_id: "federate".into(),
            properties: properties.as_object().cloned().unwrap_or_default(),
            inputs: inputs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            runtime_data: runtime.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            authenticated_user: None,
            trace_id: "trace-1".into(),
        }
    }

    fn oidc_properties(server: &MockServer) -> serde_json::Value {
        json!({
            "client_id": "thunder-client",
            "client_secret": "secret",
            "redirect_uri": "https://thunder.test/auth/oauth/standard/finish",
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
            "userinfo_endpoint": "",
            "scopes": "openid"
        })
    }

    #[tokio::test]
    async fn phase_one_redirects_with_state_and_nonce() {
        let server = MockServer::start().await;
        let executor = OidcExecutor::standard(reqwest::Client::new(), StubResolver::empty());
        let ctx = node_ctx(FlowType::Authentication, oidc_properties(&server), &[], &[]);

        let response = executor.execute(&ctx).await.unwrap();
        assert_eq!(response.status(), ExecutorStatus::ExternalRedirection);

        let url = Url::parse(response.redirect_url.as_deref().unwrap()).unwrap();
        let params: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(params["client_id"], "thunder-client");
        assert_eq!(params["response_type"], "code");
        assert!(!params["state"].is_empty());
        assert!(!params["nonce"].is_empty());
        // State and nonce are stashed for phase 2.
        assert_eq!(response.runtime_data.get("state"), Some(&params["state"]));
        assert_eq!(response.runtime_data.get("nonce"), Some(&params["nonce"]));
    }

    #[tokio::test]
    async fn phase_two_authenticates_a_known_local_user() {
        let server = MockServer::start().await;
        let id_token = fake_id_token(json!({
            "sub": "google-sub-1",
            "nonce": "nonce-1",
            "email": "alice@example.com",
            "name": "Alice Example",
            "iss": "https://accounts.google.com",
            "aud": "thunder-client"
        }));
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-1",
                "id_token": id_token,
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;

        let (resolver, local_id) = StubResolver::with_user("google-sub-1");
        let executor = OidcExecutor::standard(reqwest::Client::new(), resolver);
        let ctx = node_ctx(
            FlowType::Authentication,
            oidc_properties(&server),
            &[("code", "authz-code"), ("state", "state-1")],
            &[("state", "state-1"), ("nonce", "nonce-1")],
        );

        let response = executor.execute(&ctx).await.unwrap();
        assert_eq!(response.status(), ExecutorStatus::Complete);
        let user = response.authenticated_user.unwrap();
        assert_eq!(user.user_id.as_deref(), Some(local_id.to_string().as_str()));
        // User claims survive; protocol claims are dropped.
        assert_eq!(user.attributes.get("email").map(String::as_str), Some("alice@example.com"));
        assert!(!user.attributes.contains_key("iss"));
        assert!(!user.attributes.contains_key("nonce"));
    }

    #[tokio::test]
    async fn nonce_mismatch_fails_the_node() {
        let server = MockServer::start().await;
        let id_token = fake_id_token(json!({"sub": "s", "nonce": "evil"}));
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-1",
                "id_token": id_token
            })))
            .mount(&server)
            .await;

        let executor = OidcExecutor::standard(reqwest::Client::new(), StubResolver::empty());
        let ctx = node_ctx(
            FlowType::Authentication,
            oidc_properties(&server),
            &[("code", "authz-code"), ("state", "state-1")],
            &[("state", "state-1"), ("nonce", "nonce-1")],
        );

        let response = executor.execute(&ctx).await.unwrap();
        assert_eq!(response.status(), ExecutorStatus::Failure);
        assert!(response.failure_reason.unwrap().contains("nonce"));
    }

    #[tokio::test]
    async fn state_mismatch_fails_the_node() {
        let server = MockServer::start().await;
        let executor = OidcExecutor::standard(reqwest::Client::new(), StubResolver::empty());
        let ctx = node_ctx(
            FlowType::Authentication,
            oidc_properties(&server),
            &[("code", "authz-code"), ("state", "tampered")],
            &[("state", "state-1")],
        );

        let response = executor.execute(&ctx).await.unwrap();
        assert_eq!(response.status(), ExecutorStatus::Failure);
        assert!(response.failure_reason.unwrap().contains("state"));
    }

    #[tokio::test]
    async fn missing_local_user_fails_authentication_but_feeds_registration() {
        let server = MockServer::start().await;
        let id_token = fake_id_token(json!({
            "sub": "new-sub",
            "nonce": "nonce-1",
            "email": "new@example.com"
        }));
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-1",
                "id_token": id_token
            })))
            .mount(&server)
            .await;

        let executor = OidcExecutor::standard(reqwest::Client::new(), StubResolver::empty());

        let auth_ctx = node_ctx(
            FlowType::Authentication,
            oidc_properties(&server),
            &[("code", "authz-code"), ("state", "state-1")],
            &[("state", "state-1"), ("nonce", "nonce-1")],
        );
        let auth = executor.execute(&auth_ctx).await.unwrap();
        assert_eq!(auth.status(), ExecutorStatus::Failure);

        let reg_ctx = node_ctx(
            FlowType::Registration,
            oidc_properties(&server),
            &[("code", "authz-code"), ("state", "state-1")],
            &[("state", "state-1"), ("nonce", "nonce-1")],
        );
        let registration = executor.execute(&reg_ctx).await.unwrap();
        assert_eq!(registration.status(), ExecutorStatus::Complete);
        assert_eq!(registration.runtime_data.get("sub").map(String::as_str), Some("new-sub"));
        assert_eq!(
            registration.runtime_data.get("email").map(String::as_str),
            Some("new@example.com")
        );
        assert!(registration.authenticated_user.is_none());
    }

    #[tokio::test]
    async fn github_resolves_the_subject_from_the_user_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "gho_abc",
                "token_type": "bearer"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 583231,
                "login": "octocat",
                "email": "octocat@github.com"
            })))
            .mount(&server)
            .await;

        let (resolver, local_id) = StubResolver::with_user("583231");
        let executor = OidcExecutor::github(reqwest::Client::new(), resolver);
        let ctx = node_ctx(
            FlowType::Authentication,
            json!({
                "client_id": "gh-client",
                "client_secret": "gh-secret",
                "redirect_uri": "https://thunder.test/auth/oauth/github/finish",
                "token_endpoint": format!("{}/token", server.uri()),
                "userinfo_endpoint": format!("{}/user", server.uri())
            }),
            &[("code", "gh-code"), ("state", "s1")],
            &[("state", "s1")],
        );

        let response = executor.execute(&ctx).await.unwrap();
        assert_eq!(response.status(), ExecutorStatus::Complete);
        let user = response.authenticated_user.unwrap();
        assert_eq!(user.user_id.as_deref(), Some(local_id.to_string().as_str()));
        assert_eq!(user.attributes.get("login").map(String::as_str), Some("octocat"));
    }

    #[tokio::test]
    async fn token_endpoint_rejection_fails_the_node_with_the_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant"
            })))
            .mount(&server)
            .await;

        let executor = OidcExecutor::standard(reqwest::Client::new(), StubResolver::empty());
        let ctx = node_ctx(
            FlowType::Authentication,
            oidc_properties(&server),
            &[("code", "expired-code"), ("state", "s1")],
            &[("state", "s1")],
        );

        let response = executor.execute(&ctx).await.unwrap();
        assert_eq!(response.status(), ExecutorStatus::Failure);
        assert!(response.failure_reason.unwrap().contains("400"));
    }
}
