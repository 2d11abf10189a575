//! # Token Service
//!
//! OAuth2/OIDC protocol core: grant handling at the token endpoint, the
//! authorization-code round-trip, UserInfo claims assembly, and token
//! introspection.
//!
//! ## Grants
//!
//! | Grant                | Subject        | Notes                          |
//! |----------------------|----------------|--------------------------------|
//! | `authorization_code` | code's user    | single-use code, PKCE, nonce   |
//! | (flow assertion)     | assertion user | completed-flow exchange        |
//! | `refresh_token`      | token's user   | rotation per `renew_on_grant`  |
//! | `client_credentials` | the client     | `openid` is not honored        |
//!
//! Authorization codes are consumed with an atomic delete-and-return, so a
//! replayed code fails with `invalid_grant`. Flow assertions are bound to
//! their flow context, which is deleted on exchange, making them single-use
//! as well.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::config::{JwtConfig, OAuthConfig};
use shared::crypto::{token_digest, JwtService};
use shared::errors::{ServiceError, ServiceResult};
use shared::observability::{Event, EventBus, EventStatus};
use uuid::Uuid;

use crate::domain::{Application, AuthorizationCode, RefreshTokenRecord};
use crate::flow::engine::FlowContextStore;
use crate::flow::executors::assert::AssertionService;
use crate::flow::FlowStatus;

use super::claims::build_claims;
use super::client_auth::ApplicationLookup;

// =============================================================================
// Seams
// =============================================================================

/// Authorization-code persistence.
#[async_trait]
pub trait CodeStore: Send + Sync {
    async fn insert(&self, code: &AuthorizationCode) -> ServiceResult<()>;
    /// Atomic delete-and-return; `None` for unknown or already-used codes.
    async fn consume(&self, code_hash: &str) -> ServiceResult<Option<AuthorizationCode>>;
}

/// Refresh-token persistence.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(
        &self,
        token_hash: &str,
        client_id: &str,
        user_sub: Option<&str>,
        scope: &str,
        expires_at: chrono::DateTime<Utc>,
    ) -> ServiceResult<RefreshTokenRecord>;
    async fn find_by_hash(&self, token_hash: &str) -> ServiceResult<Option<RefreshTokenRecord>>;
    async fn revoke(&self, id: Uuid) -> ServiceResult<()>;
}

/// User-attribute resolution for claims assembly.
#[async_trait]
pub trait SubjectSource: Send + Sync {
    /// The stored attribute document of `sub`.
    async fn attributes_for(&self, sub: &str) -> ServiceResult<serde_json::Value>;
}

/// Pluggable scope validation. The default implementation returns the
/// requested scopes unchanged; the extension point is the contract, not the
/// current body.
pub trait ScopeValidator: Send + Sync {
    fn validate(&self, app: &Application, requested: &[String]) -> ServiceResult<Vec<String>>;
}

/// Passthrough validator.
pub struct DefaultScopeValidator;

impl ScopeValidator for DefaultScopeValidator {
    fn validate(&self, _app: &Application, requested: &[String]) -> ServiceResult<Vec<String>> {
        Ok(requested.to_vec())
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// Parameters of one token-endpoint request (client credentials excluded;
/// client auth runs first).
#[derive(Debug, Clone, Default)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub assertion: Option<String>,
}

/// The token-endpoint response body.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

/// RFC 7662 introspection response.
#[derive(Debug, Clone, Serialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl IntrospectionResponse {
    fn inactive() -> Self {
        Self {
            active: false,
            scope: None,
            client_id: None,
            sub: None,
            exp: None,
            iat: None,
            iss: None,
        }
    }
}

/// Parameters binding a new authorization code.
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
}

// =============================================================================
// Service
// =============================================================================

pub struct TokenService {
    jwt: Arc<JwtService>,
    assertions: AssertionService,
    codes: Arc<dyn CodeStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    flow_store: Arc<dyn FlowContextStore>,
    subjects: Arc<dyn SubjectSource>,
    applications: Arc<dyn ApplicationLookup>,
    scope_validator: Arc<dyn ScopeValidator>,
    jwt_config: JwtConfig,
    oauth_config: OAuthConfig,
    bus: EventBus,
}

impl TokenService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jwt: Arc<JwtService>,
        assertions: AssertionService,
        codes: Arc<dyn CodeStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        flow_store: Arc<dyn FlowContextStore>,
        subjects: Arc<dyn SubjectSource>,
        applications: Arc<dyn ApplicationLookup>,
        scope_validator: Arc<dyn ScopeValidator>,
        jwt_config: JwtConfig,
        oauth_config: OAuthConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            jwt,
            assertions,
            codes,
            refresh_tokens,
            flow_store,
            subjects,
            applications,
            scope_validator,
            jwt_config,
            oauth_config,
            bus,
        }
    }

    // =========================================================================
    // TOKEN ENDPOINT
    // =========================================================================

    pub async fn handle_token_request(
        &self,
        app: &Application,
        request: TokenRequest,
        trace_id: &str,
    ) -> ServiceResult<TokenResponse> {
        if !app.allows_grant(&request.grant_type) {
            return Err(ServiceError::unauthorized_client(format!(
                "grant type {} not allowed for this client",
                request.grant_type
            )));
        }

        let response = match request.grant_type.as_str() {
            "authorization_code" => {
                if request.assertion.is_some() {
                    self.assertion_grant(app, &request).await?
                } else {
                    self.authorization_code_grant(app, &request).await?
                }
            }
            "refresh_token" => self.refresh_token_grant(app, &request).await?,
            "client_credentials" => self.client_credentials_grant(app, &request).await?,
            other => {
                return Err(ServiceError::unsupported_grant_type(format!(
                    "grant type {} is not supported",
                    other
                )))
            }
        };

        self.bus.publish(
            Event::new("token.issued", "token-service")
                .with_trace_id(trace_id)
                .with_status(EventStatus::Success)
                .with_data(serde_json::json!({
                    "client_id": app.client_id,
                    "grant_type": request.grant_type,
                    "scope": response.scope,
                })),
        );
        Ok(response)
    }

    async fn authorization_code_grant(
        &self,
        app: &Application,
        request: &TokenRequest,
    ) -> ServiceResult<TokenResponse> {
        let code = request
            .code
            .as_deref()
            .ok_or_else(|| ServiceError::invalid_request("code is required"))?;
        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .ok_or_else(|| ServiceError::invalid_request("redirect_uri is required"))?;

        // Single use: the consume either returns the binding exactly once or
        // nothing at all.
        let binding = self
            .codes
            .consume(&token_digest(code))
            .await?
            .ok_or_else(|| ServiceError::invalid_grant("authorization code is invalid or already used"))?;

        if binding.is_expired(Utc::now()) {
            return Err(ServiceError::invalid_grant("authorization code has expired"));
        }
        if binding.client_id != app.client_id {
            return Err(ServiceError::invalid_grant("code was issued to a different client"));
        }
        if binding.redirect_uri != redirect_uri {
            return Err(ServiceError::invalid_grant("redirect_uri does not match the code binding"));
        }
        verify_pkce(&binding, request.code_verifier.as_deref())?;

        let scopes: Vec<String> = binding.scope.split_whitespace().map(String::from).collect();
        let id_token = if scopes.iter().any(|s| s == "openid") {
            Some(
                self.issue_id_token(app, &binding.user_sub, &scopes, binding.nonce.as_deref())
                    .await?,
            )
        } else {
            None
        };

        self.finish_issuance(app, &binding.user_sub, scopes, id_token, true)
            .await
    }

    /// Completed-flow assertion exchange: the flow context is consumed, so
    /// the assertion works exactly once.
    async fn assertion_grant(
        &self,
        app: &Application,
        request: &TokenRequest,
    ) -> ServiceResult<TokenResponse> {
        let assertion = request
            .assertion
            .as_deref()
            .ok_or_else(|| ServiceError::invalid_request("assertion is required"))?;
        let claims = self.assertions.verify(assertion, &app.client_id)?;

        let ctx = self
            .flow_store
            .load(&claims.flow_id)
            .await?
            .ok_or_else(|| ServiceError::invalid_grant("assertion was already exchanged"))?;
        if ctx.status != FlowStatus::Complete || ctx.assertion.as_deref() != Some(assertion) {
            return Err(ServiceError::invalid_grant("assertion does not match a completed flow"));
        }
        self.flow_store.delete(&claims.flow_id).await?;

        let requested: Vec<String> = request
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_else(|| app.scopes.clone());
        let scopes = self.scope_validator.validate(app, &requested)?;

        let id_token = if scopes.iter().any(|s| s == "openid") {
            Some(self.issue_id_token(app, &claims.user_id, &scopes, None).await?)
        } else {
            None
        };

        self.finish_issuance(app, &claims.user_id, scopes, id_token, true)
            .await
    }

    async fn refresh_token_grant(
        &self,
        app: &Application,
        request: &TokenRequest,
    ) -> ServiceResult<TokenResponse> {
        let presented = request
            .refresh_token
            .as_deref()
            .ok_or_else(|| ServiceError::invalid_request("refresh_token is required"))?;

        let record = self
            .refresh_tokens
            .find_by_hash(&token_digest(presented))
            .await?
            .ok_or_else(|| ServiceError::invalid_grant("refresh token is not recognized"))?;

        if !record.is_usable(Utc::now()) {
            return Err(ServiceError::invalid_grant("refresh token is expired or revoked"));
        }
        if record.client_id != app.client_id {
            return Err(ServiceError::invalid_grant("refresh token belongs to a different client"));
        }

        let scopes: Vec<String> = record.scope.split_whitespace().map(String::from).collect();
        let sub = record.user_sub.clone().unwrap_or_else(|| app.client_id.clone());
        let (access_token, expires_in) = self.issue_access_token(app, &sub, &scopes, None)?;

        // Rotation: a renewed grant invalidates the prior token; otherwise
        // the presented token stays valid until its own expiry.
        let refresh_token = if self.oauth_config.refresh_token.renew_on_grant {
            self.refresh_tokens.revoke(record.id).await?;
            Some(
                self.mint_refresh_token(app, record.user_sub.as_deref(), &record.scope)
                    .await?,
            )
        } else {
            None
        };

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer",
            expires_in,
            refresh_token,
            id_token: None,
            scope: scopes.join(" "),
        })
    }

    async fn client_credentials_grant(
        &self,
        app: &Application,
        request: &TokenRequest,
    ) -> ServiceResult<TokenResponse> {
        let requested: Vec<String> = request
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_else(|| app.scopes.clone());
        // `openid` is meaningless without an end-user subject.
        let scopes: Vec<String> = self
            .scope_validator
            .validate(app, &requested)?
            .into_iter()
            .filter(|s| s != "openid")
            .collect();

        let (access_token, expires_in) =
            self.issue_access_token(app, &app.client_id, &scopes, None)?;
        Ok(TokenResponse {
            access_token,
            token_type: "Bearer",
            expires_in,
            refresh_token: None,
            id_token: None,
            scope: scopes.join(" "),
        })
    }

    async fn finish_issuance(
        &self,
        app: &Application,
        sub: &str,
        scopes: Vec<String>,
        id_token: Option<String>,
        with_refresh_token: bool,
    ) -> ServiceResult<TokenResponse> {
        let (access_token, expires_in) = self.issue_access_token(app, sub, &scopes, None)?;
        let refresh_token = if with_refresh_token && app.allows_grant("refresh_token") {
            Some(self.mint_refresh_token(app, Some(sub), &scopes.join(" ")).await?)
        } else {
            None
        };
        Ok(TokenResponse {
            access_token,
            token_type: "Bearer",
            expires_in,
            refresh_token,
            id_token,
            scope: scopes.join(" "),
        })
    }

    fn issue_access_token(
        &self,
        app: &Application,
        sub: &str,
        scopes: &[String],
        nonce: Option<&str>,
    ) -> ServiceResult<(String, i64)> {
        let now = Utc::now().timestamp();
        let expires_in = self.jwt_config.validity_period as i64;
        let mut claims = serde_json::json!({
            "iss": self.jwt.issuer(),
            "sub": sub,
            "aud": app.client_id,
            "exp": now + expires_in,
            "nbf": now,
            "iat": now,
            "jti": Uuid::new_v4().to_string(),
            "scope": scopes.join(" "),
        });
        if let Some(nonce) = nonce {
            claims["nonce"] = serde_json::Value::String(nonce.to_string());
        }
        Ok((self.jwt.sign(&claims)?, expires_in))
    }

    async fn issue_id_token(
        &self,
        app: &Application,
        sub: &str,
        scopes: &[String],
        nonce: Option<&str>,
    ) -> ServiceResult<String> {
        let attributes = self.subjects.attributes_for(sub).await?;
        let scope_refs: Vec<&str> = scopes.iter().map(String::as_str).collect();
        let mut claims = build_claims(&scope_refs, &attributes, app);

        let now = Utc::now().timestamp();
        claims.insert("iss".into(), self.jwt.issuer().into());
        claims.insert("sub".into(), sub.into());
        claims.insert("aud".into(), app.client_id.clone().into());
        claims.insert("exp".into(), (now + self.jwt_config.validity_period as i64).into());
        claims.insert("iat".into(), now.into());
        if let Some(nonce) = nonce {
            claims.insert("nonce".into(), nonce.into());
        }
        self.jwt.sign(&serde_json::Value::Object(claims))
    }

    async fn mint_refresh_token(
        &self,
        app: &Application,
        user_sub: Option<&str>,
        scope: &str,
    ) -> ServiceResult<String> {
        let token = opaque_token();
        let expires_at =
            Utc::now() + Duration::seconds(self.oauth_config.refresh_token.validity_period as i64);
        self.refresh_tokens
            .insert(&token_digest(&token), &app.client_id, user_sub, scope, expires_at)
            .await?;
        Ok(token)
    }

    // =========================================================================
    // AUTHORIZATION CODES
    // =========================================================================

    /// Exchanges a completed-flow assertion for an authorization code bound
    /// to `(client_id, redirect_uri, scope, pkce, user, nonce)`.
    pub async fn complete_authorization(
        &self,
        assertion: &str,
        grant: AuthorizationGrant,
    ) -> ServiceResult<String> {
        let app = self
            .applications
            .by_client_id(&grant.client_id)
            .await?
            .ok_or_else(|| ServiceError::invalid_client("unknown client"))?;
        if !app.allows_redirect_uri(&grant.redirect_uri) {
            return Err(ServiceError::invalid_request("redirect_uri is not registered"));
        }

        let claims = self.assertions.verify(assertion, &grant.client_id)?;
        let ctx = self
            .flow_store
            .load(&claims.flow_id)
            .await?
            .ok_or_else(|| ServiceError::invalid_grant("assertion was already exchanged"))?;
        if ctx.status != FlowStatus::Complete || ctx.assertion.as_deref() != Some(assertion) {
            return Err(ServiceError::invalid_grant("assertion does not match a completed flow"));
        }
        self.flow_store.delete(&claims.flow_id).await?;

        let code = opaque_token();
        self.codes
            .insert(&AuthorizationCode {
                code_hash: token_digest(&code),
                client_id: grant.client_id,
                redirect_uri: grant.redirect_uri,
                scope: grant.scope,
                code_challenge: grant.code_challenge,
                code_challenge_method: grant.code_challenge_method,
                user_sub: claims.user_id,
                nonce: grant.nonce,
                expires_at: Utc::now()
                    + Duration::seconds(self.oauth_config.authorization_code.validity_period as i64),
            })
            .await?;
        Ok(code)
    }

    // =========================================================================
    // USERINFO
    // =========================================================================

    /// Assembles the UserInfo response for a bearer access token.
    ///
    /// Signature (and lifetime) are verified; issuer/audience checks are the
    /// caller's policy. The token must carry `sub` and the `openid` scope.
    pub async fn userinfo(&self, bearer_token: &str) -> ServiceResult<serde_json::Value> {
        let claims = self.jwt.verify(bearer_token, None, None)?;

        let sub = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::invalid_token("token has no sub claim"))?;
        let scope = claims.get("scope").and_then(|v| v.as_str()).unwrap_or("");
        let scopes: Vec<&str> = scope.split_whitespace().collect();
        if !scopes.contains(&"openid") {
            return Err(ServiceError::insufficient_scope(
                "the openid scope is required for UserInfo",
            ));
        }

        let attributes = self
            .subjects
            .attributes_for(sub)
            .await
            .map_err(|_| ServiceError::invalid_token("token subject is unknown"))?;

        let app = claims
            .get("aud")
            .and_then(|v| v.as_str())
            .map(|aud| self.applications.by_client_id(aud));
        let mut body = match app {
            Some(lookup) => match lookup.await? {
                Some(app) => build_claims(&scopes, &attributes, &app),
                None => serde_json::Map::new(),
            },
            None => serde_json::Map::new(),
        };
        body.insert("sub".into(), sub.into());
        Ok(serde_json::Value::Object(body))
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    /// RFC 7662: valid tokens report `active` plus metadata, everything else
    /// is simply inactive.
    pub async fn introspect(&self, token: &str) -> IntrospectionResponse {
        let claims = match self.jwt.verify(token, None, Some(self.jwt.issuer())) {
            Ok(claims) => claims,
            Err(_) => return IntrospectionResponse::inactive(),
        };
        IntrospectionResponse {
            active: true,
            scope: claims.get("scope").and_then(|v| v.as_str()).map(String::from),
            client_id: claims.get("aud").and_then(|v| v.as_str()).map(String::from),
            sub: claims.get("sub").and_then(|v| v.as_str()).map(String::from),
            exp: claims.get("exp").and_then(|v| v.as_i64()),
            iat: claims.get("iat").and_then(|v| v.as_i64()),
            iss: claims.get("iss").and_then(|v| v.as_str()).map(String::from),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn verify_pkce(binding: &AuthorizationCode, verifier: Option<&str>) -> ServiceResult<()> {
    let Some(challenge) = binding.code_challenge.as_deref() else {
        return Ok(());
    };
    let verifier = verifier
        .ok_or_else(|| ServiceError::invalid_grant("code_verifier is required for this code"))?;

    let matches = match binding.code_challenge_method.as_deref().unwrap_or("plain") {
        "S256" => {
            let digest = Sha256::digest(verifier.as_bytes());
            URL_SAFE_NO_PAD.encode(digest) == challenge
        }
        "plain" => verifier == challenge,
        other => {
            return Err(ServiceError::invalid_grant(format!(
                "unsupported code_challenge_method {}",
                other
            )))
        }
    };
    if !matches {
        return Err(ServiceError::invalid_grant("PKCE verification failed"));
    }
    Ok(())
}

/// 256-bit url-safe opaque token.
fn opaque_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// =============================================================================
// Tests
// =============================================================================
