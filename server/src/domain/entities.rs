//! # Domain Entities
//!
//! Persistent records for the three logical datasources.
//!
//! | Datasource | Entities                                                   |
//! |------------|------------------------------------------------------------|
//! | identity   | [`Application`], [`FlowDefinitionRecord`], [`NotificationSender`] |
//! | user       | [`User`], [`OrgUnit`]                                      |
//! | runtime    | [`AuthorizationCode`], [`RefreshTokenRecord`], [`OtpBinding`], flow contexts |
//!
//! Secrets never appear in these records in recoverable form: client secrets
//! and user credentials are Argon2 verifiers, opaque tokens are SHA-256
//! digests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// =============================================================================
// APPLICATION
// =============================================================================

/// A registered OAuth2 client application.
///
/// Invariants: `client_id` is globally unique; at least one allowed
/// token-endpoint auth method; an app allowing `none` is public and carries
/// no client-secret verifier.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Application {
    pub id: Uuid,
    pub name: String,
    pub client_id: String,
    /// Argon2 verifier for the client secret; `None` for public clients.
    #[serde(skip_serializing)]
    pub client_secret_hash: Option<String>,
    /// Allowed grant types (`authorization_code`, `refresh_token`, ...).
    pub grant_types: Vec<String>,
    /// Allowed token-endpoint auth methods (`client_secret_basic`,
    /// `client_secret_post`, `none`).
    pub token_auth_methods: Vec<String>,
    pub redirect_uris: Vec<String>,
    /// Scopes the application may request.
    pub scopes: Vec<String>,
    /// Per-scope claim overrides: `{"profile": ["name", "picture"], ...}`.
    pub scope_claims: serde_json::Value,
    /// Allow-list for claims in ID tokens / UserInfo. Empty = no filtering.
    pub id_token_user_attributes: Vec<String>,
    /// Authentication-flow graph handle; `None` falls back to the configured
    /// default flow.
    pub auth_flow_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    /// Whether this app may omit client credentials at the token endpoint.
    pub fn is_public(&self) -> bool {
        self.token_auth_methods.iter().any(|m| m == "none")
    }

    pub fn allows_grant(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }

    pub fn allows_auth_method(&self, method: &str) -> bool {
        self.token_auth_methods.iter().any(|m| m == method)
    }

    pub fn allows_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == uri)
    }
}

/// Insert payload for a new application. The raw client secret is hashed by
/// the service layer before this struct reaches the repository.
#[derive(Debug, Clone)]
pub struct NewApplication {
    pub name: String,
    pub client_id: String,
    pub client_secret_hash: Option<String>,
    pub grant_types: Vec<String>,
    pub token_auth_methods: Vec<String>,
    pub redirect_uris: Vec<String>,
    pub scopes: Vec<String>,
    pub scope_claims: serde_json::Value,
    pub id_token_user_attributes: Vec<String>,
    pub auth_flow_id: Option<String>,
}

// =============================================================================
// USER
// =============================================================================

/// Reserved attribute keys that must never be persisted as user attributes;
/// they belong to flow runtime state.
pub const RESERVED_ATTRIBUTE_KEYS: [&str; 9] = [
    "userID",
    "code",
    "nonce",
    "state",
    "flowID",
    "otp",
    "attemptCount",
    "expiryTimeInMillis",
    "value",
];

/// An end-user record. The attribute document is opaque JSON owned by the
/// deployment's schema conventions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    /// Owning organization unit.
    pub ou_id: Uuid,
    #[sqlx(rename = "user_type")]
    #[serde(rename = "type")]
    pub user_type: String,
    pub attributes: serde_json::Value,
    /// Argon2 verifier for the user's password, when one is set.
    #[serde(skip_serializing)]
    pub credential_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Reads a string attribute, when present and a string.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// Insert payload for a new user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub ou_id: Uuid,
    pub user_type: String,
    pub attributes: serde_json::Value,
    pub credential_hash: Option<String>,
}

/// An organization unit owning users.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrgUnit {
    pub id: Uuid,
    /// Stable handle, unique among siblings.
    pub handle: String,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// RUNTIME RECORDS
// =============================================================================

/// A single-use authorization code binding. The code itself is stored as a
/// SHA-256 digest; consumption is an atomic delete-and-return.
#[derive(Debug, Clone, FromRow)]
pub struct AuthorizationCode {
    pub code_hash: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub user_sub: String,
    pub nonce: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A store-backed opaque refresh token.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub token_hash: String,
    pub client_id: String,
    /// `None` for `client_credentials` grants.
    pub user_sub: Option<String>,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// A pending OTP challenge bound to a flow.
#[derive(Debug, Clone, FromRow)]
pub struct OtpBinding {
    pub id: Uuid,
    pub flow_id: String,
    pub user_id: Uuid,
    /// `sms` or `email`.
    pub channel: String,
    pub recipient: String,
    pub otp_hash: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OtpBinding {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// =============================================================================
// IDENTITY RECORDS
// =============================================================================

/// A stored flow-graph definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowDefinitionRecord {
    /// Graph handle, e.g. `auth_flow_config_basic`.
    pub id: String,
    /// `AUTHENTICATION` or `REGISTRATION`.
    pub flow_type: String,
    /// The declarative graph document.
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A configured notification sender.
///
/// Property values holding credentials are encrypted at rest by the
/// repository before they reach this record's serialized form.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationSender {
    pub id: Uuid,
    pub name: String,
    /// `twilio`, `vonage`, or `custom`.
    pub provider: String,
    pub properties: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
