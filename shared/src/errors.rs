//! # Service-Error Model
//!
//! Uniform error record returned at every service boundary.
//!
//! ## Design
//!
//! Every internal service returns either a value or a [`ServiceError`],
//! never both. The error carries three fields that form part of the external
//! contract:
//!
//! | Field         | Meaning                                              |
//! |---------------|------------------------------------------------------|
//! | `kind`        | Coarse classification driving the HTTP status        |
//! | `code`        | Stable machine-readable string (e.g. `invalid_token`)|
//! | `description` | Human-readable detail                                |
//!
//! ## Kind → HTTP mapping
//!
//! | Kind       | Status                                   |
//! |------------|------------------------------------------|
//! | `client`   | 400 (401/403 for selected OAuth codes)   |
//! | `not-found`| 404                                      |
//! | `conflict` | 409                                      |
//! | `server`   | 500                                      |
//!
//! Handlers never build error bodies by hand: the [`actix_web::ResponseError`]
//! implementation renders the structured JSON body
//! `{"error": code, "error_description": description}`.
//!
//! ## Logging contract
//!
//! Server-kind errors are logged at `error` level with code and description;
//! client and not-found errors are logged at `debug` to keep expected
//! failures out of the noise.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

// =============================================================================
// Type Aliases
// =============================================================================

/// Result type alias used by services and handlers.
pub type ServiceResult<T> = Result<T, ServiceError>;

// =============================================================================
// Error Kind
// =============================================================================

/// Coarse error classification.
///
/// The kind is the only input to status-code mapping (modulo a handful of
/// OAuth codes that carry their RFC-mandated statuses) and to the logging
/// level decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Invalid input from the caller (bad JSON, missing parameter,
    /// invalid grant, wrong password).
    Client,
    /// Entity absent.
    NotFound,
    /// Concurrency or idempotence violation (duplicate flow step,
    /// duplicate user on provisioning).
    Conflict,
    /// Unexpected failure (database outage, marshal failure, panic).
    Server,
}

// =============================================================================
// Service Error
// =============================================================================

/// The uniform error record.
///
/// Codes are stable strings and part of the external contract; they follow
/// either the OAuth2 registry (`invalid_client`, `insufficient_scope`, ...)
/// or the `XXX-NNNN` component convention (`USR-1001`, `FLW-1003`, ...).
#[derive(Debug, Clone, Error)]
#[error("{code}: {description}")]
pub struct ServiceError {
    /// Coarse classification driving HTTP status and log level.
    pub kind: ErrorKind,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable detail.
    pub description: String,
}

impl ServiceError {
    /// Builds a client-kind error.
    pub fn client(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Client, code: code.into(), description: description.into() }
    }

    /// Builds a not-found-kind error.
    pub fn not_found(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self { kind: ErrorKind::NotFound, code: code.into(), description: description.into() }
    }

    /// Builds a conflict-kind error.
    pub fn conflict(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Conflict, code: code.into(), description: description.into() }
    }

    /// Builds a server-kind error.
    pub fn server(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Server, code: code.into(), description: description.into() }
    }

    // =========================================================================
    // OAUTH2 CODE FAMILY
    // =========================================================================

    /// `invalid_request`: malformed or contradictory request parameters.
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::client("invalid_request", description)
    }

    /// `invalid_client`: unknown client or failed client authentication.
    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::client("invalid_client", description)
    }

    /// `unauthorized_client`: client not allowed to use the mechanism.
    pub fn unauthorized_client(description: impl Into<String>) -> Self {
        Self::client("unauthorized_client", description)
    }

    /// `invalid_grant`: bad, expired, or already-consumed grant material.
    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::client("invalid_grant", description)
    }

    /// `unsupported_grant_type`.
    pub fn unsupported_grant_type(description: impl Into<String>) -> Self {
        Self::client("unsupported_grant_type", description)
    }

    /// `invalid_scope`.
    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self::client("invalid_scope", description)
    }

    /// `invalid_token`: bearer token failed verification.
    pub fn invalid_token(description: impl Into<String>) -> Self {
        Self::client("invalid_token", description)
    }

    /// `insufficient_scope`: token lacks a required scope.
    pub fn insufficient_scope(description: impl Into<String>) -> Self {
        Self::client("insufficient_scope", description)
    }

    /// Returns `true` for server-kind errors.
    ///
    /// Server errors are logged at error level and never expose internal
    /// detail beyond their description.
    pub fn is_server_error(&self) -> bool {
        self.kind == ErrorKind::Server
    }

    /// Returns the HTTP status for this error.
    ///
    /// Most client-kind errors map to 400; the bearer-token codes carry
    /// their RFC 6750 statuses (401 / 403), and `invalid_client` maps to
    /// 401 per RFC 6749 §5.2.
    pub fn status_code(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Client => match self.code.as_str() {
                "invalid_client" | "invalid_token" => StatusCode::UNAUTHORIZED,
                "insufficient_scope" => StatusCode::FORBIDDEN,
                _ => StatusCode::BAD_REQUEST,
            },
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Server => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Emits this error to the log per the logging contract.
    pub fn log(&self) {
        if self.is_server_error() {
            tracing::error!(code = %self.code, description = %self.description, "service error");
        } else {
            tracing::debug!(code = %self.code, description = %self.description, "service error");
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<sqlx::Error> for ServiceError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => {
                Self::not_found("NOT-1000", "requested record does not exist")
            }
            other => Self::server("SRV-1000", format!("database error: {}", other)),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        Self::server("SRV-1001", format!("serialization error: {}", e))
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(e: validator::ValidationErrors) -> Self {
        Self::invalid_request(format!("validation failed: {}", e))
    }
}

// =============================================================================
// Response Body
// =============================================================================

/// JSON body rendered for every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Stable error code.
    pub error: String,
    /// Human-readable detail.
    pub error_description: String,
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        self.status_code()
    }

    fn error_response(&self) -> HttpResponse {
        self.log();
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.code.clone(),
            error_description: self.description.clone(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_400_by_default() {
        assert_eq!(
            ServiceError::invalid_request("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::invalid_grant("expired").status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn bearer_token_codes_carry_rfc6750_statuses() {
        assert_eq!(
            ServiceError::invalid_token("bad signature").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServiceError::insufficient_scope("openid required").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ServiceError::invalid_client("unknown").status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(
            ServiceError::not_found("USR-1001", "no such user").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::conflict("FLW-1007", "step in progress").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::server("SRV-1000", "db down").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn only_server_kind_is_server_error() {
        assert!(ServiceError::server("SRV-1000", "x").is_server_error());
        assert!(!ServiceError::invalid_request("x").is_server_error());
        assert!(!ServiceError::not_found("NOT-1000", "x").is_server_error());
        assert!(!ServiceError::conflict("CON-1000", "x").is_server_error());
    }

    #[test]
    fn row_not_found_converts_to_not_found_kind() {
        let err: ServiceError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn display_includes_code_and_description() {
        let err = ServiceError::invalid_token("signature mismatch");
        assert_eq!(err.to_string(), "invalid_token: signature mismatch");
    }
}
