//! # Application Configuration
//!
//! Layered configuration for the Thunder server.
//!
//! ## Layering
//!
//! Configuration is assembled from three layers, lowest precedence first:
//!
//! 1. **Embedded defaults**: a JSON document compiled into the binary.
//! 2. **User file**: a YAML file (path passed at startup) merged over the
//!    defaults with the rules below.
//! 3. **Environment variables**: `THUNDER_*` with `__` as the nested
//!    separator (e.g. `THUNDER_SERVER__PORT=9090`), applied last. A local
//!    `.env` file is honored for development convenience.
//!
//! ## Merge rules
//!
//! The user file never has to repeat a default. When both layers define a
//! field:
//!
//! | Field shape | Rule                                        |
//! |-------------|---------------------------------------------|
//! | scalar      | user value wins when non-zero / non-empty   |
//! | sequence    | user value replaces when non-empty          |
//! | mapping     | merged key-wise, recursing into both sides  |
//!
//! A `false` boolean and a `0` number count as zero values and keep the
//! default; use an explicit non-zero sentinel where a field must be able to
//! express "off" (e.g. `cache.disabled: true`).
//!
//! ## Sections
//!
//! `server`, `gate_client`, `security`, `database` (identity / runtime /
//! user datasources), `cache`, `jwt`, `oauth`, `flow`, `cors`, `hash`,
//! `immutable_resources`, `observability`.

use std::collections::HashMap;
use std::path::Path;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use serde_json::Value;

// =============================================================================
// Embedded Defaults
// =============================================================================

/// Compiled-in defaults. Every recognized key appears here so the merge has
/// a complete base document to work from.
const DEFAULTS_JSON: &str = r#"{
  "server": {
    "hostname": "0.0.0.0",
    "port": 8090,
    "http_only": true,
    "public_url": "https://localhost:8090",
    "identifier": "thunder"
  },
  "gate_client": {
    "hostname": "localhost",
    "port": 9090,
    "scheme": "https",
    "path": "/",
    "login_path": "/login",
    "error_path": "/error"
  },
  "security": {
    "cert_file": "",
    "key_file": "",
    "crypto_file": ""
  },
  "database": {
    "identity": {
      "type": "postgres",
      "hostname": "localhost",
      "port": 5432,
      "name": "thunder_identity",
      "user": "thunder",
      "password": "",
      "sslmode": "disable",
      "path": "",
      "options": "",
      "max_connections": 10,
      "min_connections": 1,
      "connect_timeout_seconds": 30
    },
    "runtime": {
      "type": "postgres",
      "hostname": "localhost",
      "port": 5432,
      "name": "thunder_runtime",
      "user": "thunder",
      "password": "",
      "sslmode": "disable",
      "path": "",
      "options": "",
      "max_connections": 10,
      "min_connections": 1,
      "connect_timeout_seconds": 30
    },
    "user": {
      "type": "postgres",
      "hostname": "localhost",
      "port": 5432,
      "name": "thunder_user",
      "user": "thunder",
      "password": "",
      "sslmode": "disable",
      "path": "",
      "options": "",
      "max_connections": 10,
      "min_connections": 1,
      "connect_timeout_seconds": 30
    }
  },
  "cache": {
    "disabled": false,
    "type": "in_memory",
    "size": 1000,
    "ttl": 300,
    "eviction_policy": "lru",
    "cleanup_interval": 60,
    "properties": {}
  },
  "jwt": {
    "issuer": "thunder",
    "validity_period": 3600,
    "audience": "",
    "algorithm": "HS256",
    "secret": "development-only-secret-change-me-0123456789"
  },
  "oauth": {
    "refresh_token": {
      "renew_on_grant": false,
      "validity_period": 86400
    },
    "authorization_code": {
      "validity_period": 600
    }
  },
  "flow": {
    "graph_directory": "resources/flows",
    "authn": {
      "default_flow": "auth_flow_config_basic"
    }
  },
  "cors": {
    "allowed_origins": []
  },
  "hash": {
    "algorithm": "argon2id"
  },
  "immutable_resources": {
    "enabled": false
  },
  "observability": {
    "enabled": true,
    "failure_mode": "warn",
    "output": {
      "console": {
        "enabled": true,
        "format": "json",
        "categories": ["ALL"]
      },
      "file": {
        "enabled": false,
        "format": "json",
        "categories": ["ALL"],
        "path": "logs/events.log",
        "max_size_bytes": 10485760,
        "flush_interval_seconds": 5
      },
      "opentelemetry": {
        "enabled": false,
        "endpoint": "http://localhost:4317",
        "categories": ["ALL"]
      }
    }
  }
}"#;

// =============================================================================
// Merge
// =============================================================================

/// Merges `user` over `defaults` in place.
///
/// Mappings merge key-wise (recursing), sequences replace only when the user
/// sequence is non-empty, and scalars override only when non-zero: `""`,
/// `0`, `false`, and `null` keep the default.
pub fn merge_values(defaults: &mut Value, user: Value) {
    match (defaults, user) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => {
            if !is_zero_value(&overlay) {
                *base = overlay;
            }
        }
    }
}

/// Zero values never override a default.
fn is_zero_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(_) => false,
    }
}

// =============================================================================
// Root
// =============================================================================

/// Root configuration. Immutable after load; share via `Arc`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gate_client: GateClientConfig,
    pub security: SecurityConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub jwt: JwtConfig,
    pub oauth: OAuthConfig,
    pub flow: FlowConfig,
    pub cors: CorsConfig,
    pub hash: HashConfig,
    pub immutable_resources: ImmutableResourcesConfig,
    pub observability: ObservabilityConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    /// Serve plain HTTP; TLS is usually terminated in front of the server.
    pub http_only: bool,
    /// Externally visible base URL, used in issuer/redirect construction.
    pub public_url: String,
    /// Instance identifier stamped onto observability events.
    pub identifier: String,
}

/// Settings for the hosted login client that drives interactive flows.
#[derive(Debug, Clone, Deserialize)]
pub struct GateClientConfig {
    pub hostname: String,
    pub port: u16,
    pub scheme: String,
    pub path: String,
    pub login_path: String,
    pub error_path: String,
}

impl GateClientConfig {
    /// Base URL of the gate client (`scheme://hostname:port`).
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.hostname, self.port)
    }

    /// Absolute login URL the authorize endpoint redirects browsers to.
    pub fn login_url(&self) -> String {
        format!("{}{}", self.base_url(), self.login_path)
    }
}

/// Key material locations. `cert_file` is read as a PEM public key, not an
/// X.509 certificate.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub cert_file: String,
    pub key_file: String,
    pub crypto_file: String,
}

/// The three logical datasources.
///
/// `identity` holds applications, IdPs, and flow definitions; `user` holds
/// user records; `runtime` holds flow contexts, authorization codes, refresh
/// tokens, and OTP bindings. They are separately configurable and may point
/// at the same physical database.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub identity: DatasourceConfig,
    pub runtime: DatasourceConfig,
    pub user: DatasourceConfig,
}

/// One datasource. `type` selects the SQL dialect used when resolving
/// per-dialect query specializations.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasourceConfig {
    #[serde(rename = "type")]
    pub db_type: String,
    pub hostname: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub sslmode: String,
    /// File path, only meaningful for the sqlite dialect.
    pub path: String,
    /// Extra URL options appended verbatim.
    pub options: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl DatasourceConfig {
    /// Builds the connection URL for this datasource.
    pub fn url(&self) -> String {
        match self.db_type.as_str() {
            "sqlite" => format!("sqlite://{}", self.path),
            _ => {
                let mut url = format!(
                    "postgres://{}:{}@{}:{}/{}?sslmode={}",
                    self.user, self.password, self.hostname, self.port, self.name, self.sslmode
                );
                if !self.options.is_empty() {
                    url.push('&');
                    url.push_str(&self.options);
                }
                url
            }
        }
    }
}

/// In-process cache tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub disabled: bool,
    #[serde(rename = "type")]
    pub cache_type: String,
    pub size: usize,
    /// Entry time-to-live in seconds.
    pub ttl: u64,
    pub eviction_policy: String,
    pub cleanup_interval: u64,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Token signing configuration.
///
/// `algorithm` selects HS256 (shared `secret`) or RS256/ES256 (PEM files
/// from the `security` section).
#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub issuer: String,
    /// Access-token validity in seconds.
    pub validity_period: u64,
    pub audience: String,
    pub algorithm: String,
    #[serde(default)]
    pub secret: String,
}

/// OAuth grant tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub refresh_token: RefreshTokenConfig,
    pub authorization_code: AuthorizationCodeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshTokenConfig {
    /// Rotate the refresh token on every grant; the prior token is revoked.
    pub renew_on_grant: bool,
    /// Refresh-token validity in seconds.
    pub validity_period: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationCodeConfig {
    /// Authorization-code validity in seconds.
    pub validity_period: u64,
}

/// Flow-subsystem configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// Directory holding declarative graph definitions (JSON).
    pub graph_directory: String,
    pub authn: AuthnFlowConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthnFlowConfig {
    /// Graph id used when an application does not name its own flow.
    pub default_flow: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HashConfig {
    /// Credential-verifier algorithm. Only `argon2id` is supported today.
    pub algorithm: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImmutableResourcesConfig {
    /// When set, declaratively-seeded resources reject mutation.
    pub enabled: bool,
}

// =============================================================================
// Observability
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub enabled: bool,
    /// `warn` logs and drops on sink failure; `strict` surfaces the error.
    pub failure_mode: String,
    pub output: ObservabilityOutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityOutputConfig {
    pub console: ConsoleSinkConfig,
    pub file: FileSinkConfig,
    pub opentelemetry: OtelSinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleSinkConfig {
    pub enabled: bool,
    pub format: String,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileSinkConfig {
    pub enabled: bool,
    pub format: String,
    pub categories: Vec<String>,
    pub path: String,
    /// Rotate once the active file exceeds this size.
    pub max_size_bytes: u64,
    pub flush_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelSinkConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub categories: Vec<String>,
}

// =============================================================================
// Loading
// =============================================================================

impl AppConfig {
    /// Loads configuration from the embedded defaults, an optional YAML user
    /// file, and `THUNDER_*` environment variables.
    pub fn load(user_file: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut merged: Value = serde_json::from_str(DEFAULTS_JSON)
            .map_err(|e| ConfigError::Message(format!("invalid embedded defaults: {}", e)))?;

        if let Some(path) = user_file {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                ConfigError::Message(format!("cannot read {}: {}", path.display(), e))
            })?;
            let user: serde_yaml::Value = serde_yaml::from_str(&raw)
                .map_err(|e| ConfigError::Message(format!("invalid YAML: {}", e)))?;
            let user_json: Value = serde_json::to_value(user)
                .map_err(|e| ConfigError::Message(format!("invalid user config: {}", e)))?;
            merge_values(&mut merged, user_json);
        }

        let merged_json = serde_json::to_string(&merged)
            .map_err(|e| ConfigError::Message(format!("merge failed: {}", e)))?;

        Config::builder()
            .add_source(File::from_str(&merged_json, FileFormat::Json))
            .add_source(
                Environment::with_prefix("THUNDER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Loads the embedded defaults only. Used by tests and tooling.
    pub fn defaults() -> Result<Self, ConfigError> {
        Self::load(None)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_merge_key_wise_and_recurse() {
        let mut defaults = json!({"a": 1, "b": {"c": 2}});
        merge_values(&mut defaults, json!({"b": {"c": 3, "d": 4}}));
        assert_eq!(defaults, json!({"a": 1, "b": {"c": 3, "d": 4}}));
    }

    #[test]
    fn empty_slice_preserves_defaults() {
        let mut defaults = json!({"origins": ["https://a.example"]});
        merge_values(&mut defaults, json!({"origins": []}));
        assert_eq!(defaults, json!({"origins": ["https://a.example"]}));
    }

    #[test]
    fn non_empty_slice_replaces() {
        let mut defaults = json!({"origins": ["https://a.example", "https://b.example"]});
        merge_values(&mut defaults, json!({"origins": ["https://c.example"]}));
        assert_eq!(defaults, json!({"origins": ["https://c.example"]}));
    }

    #[test]
    fn zero_scalars_keep_defaults() {
        let mut defaults = json!({"port": 8090, "name": "thunder", "flag": true});
        merge_values(&mut defaults, json!({"port": 0, "name": "", "flag": false}));
        assert_eq!(defaults, json!({"port": 8090, "name": "thunder", "flag": true}));
    }

    #[test]
    fn non_zero_scalars_override() {
        let mut defaults = json!({"port": 8090, "name": "thunder"});
        merge_values(&mut defaults, json!({"port": 9443, "name": "gate"}));
        assert_eq!(defaults, json!({"port": 9443, "name": "gate"}));
    }

    #[test]
    fn unknown_user_keys_are_added() {
        let mut defaults = json!({"a": 1});
        merge_values(&mut defaults, json!({"extra": {"x": true}}));
        assert_eq!(defaults, json!({"a": 1, "extra": {"x": true}}));
    }

    #[test]
    fn embedded_defaults_deserialize() {
        let cfg = AppConfig::defaults().expect("defaults must parse");
        assert_eq!(cfg.server.port, 8090);
        assert_eq!(cfg.jwt.issuer, "thunder");
        assert_eq!(cfg.database.runtime.db_type, "postgres");
        assert!(cfg.observability.enabled);
        assert_eq!(cfg.oauth.authorization_code.validity_period, 600);
    }

    #[test]
    fn postgres_url_includes_sslmode_and_options() {
        let cfg = AppConfig::defaults().unwrap();
        let mut ds = cfg.database.identity.clone();
        ds.options = "application_name=thunder".into();
        let url = ds.url();
        assert!(url.starts_with("postgres://thunder:@localhost:5432/thunder_identity"));
        assert!(url.contains("sslmode=disable"));
        assert!(url.ends_with("&application_name=thunder"));
    }

    #[test]
    fn sqlite_url_uses_path() {
        let cfg = AppConfig::defaults().unwrap();
        let mut ds = cfg.database.runtime.clone();
        ds.db_type = "sqlite".into();
        ds.path = "data/runtime.db".into();
        assert_eq!(ds.url(), "sqlite://data/runtime.db");
    }

    #[test]
    fn yaml_user_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deployment.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 9443\njwt:\n  issuer: \"https://idp.example\"\n",
        )
        .unwrap();

        let cfg = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.server.port, 9443);
        assert_eq!(cfg.jwt.issuer, "https://idp.example");
        // Untouched sections keep their defaults.
        assert_eq!(cfg.gate_client.port, 9090);
    }
}
