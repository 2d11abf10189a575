//! # Datasources & Dialected Queries
//!
//! Connection-pool management for the three logical datasources and the
//! per-dialect query record used by repositories.
//!
//! ## Logical datasources
//!
//! | Datasource | Holds                                                    |
//! |------------|----------------------------------------------------------|
//! | `identity` | applications, identity providers, flow definitions       |
//! | `user`     | user records, organization units, roles                  |
//! | `runtime`  | flow contexts, authorization codes, refresh tokens, OTPs |
//!
//! Each datasource gets its own pool; they may point at the same physical
//! database. Transactions never span datasources.
//!
//! ## Dialects
//!
//! Repositories never embed dialect-specific SQL inline. Each statement is a
//! [`Query`] record carrying a default form plus optional `postgres` /
//! `sqlite` specializations; [`Query::sql_for`] picks the right text for the
//! configured dialect.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::{DatabaseConfig, DatasourceConfig};
use crate::errors::{ServiceError, ServiceResult};

// =============================================================================
// Dialect
// =============================================================================

/// SQL dialect of a datasource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Parses the `type` field of a datasource configuration.
    pub fn from_type(db_type: &str) -> Self {
        match db_type {
            "sqlite" => Self::Sqlite,
            _ => Self::Postgres,
        }
    }
}

// =============================================================================
// Query Record
// =============================================================================

/// A named SQL statement with optional per-dialect specializations.
///
/// The `id` shows up in logs and error descriptions so slow or failing
/// statements can be traced back to their definition.
#[derive(Debug, Clone, Copy)]
pub struct Query {
    pub id: &'static str,
    /// Default form, used when no specialization matches.
    pub sql: &'static str,
    pub postgres: Option<&'static str>,
    pub sqlite: Option<&'static str>,
}

impl Query {
    /// A query with a single form valid for every dialect.
    pub const fn new(id: &'static str, sql: &'static str) -> Self {
        Self { id, sql, postgres: None, sqlite: None }
    }

    /// Attaches a Postgres specialization.
    pub const fn with_postgres(mut self, sql: &'static str) -> Self {
        self.postgres = Some(sql);
        self
    }

    /// Attaches a SQLite specialization.
    pub const fn with_sqlite(mut self, sql: &'static str) -> Self {
        self.sqlite = Some(sql);
        self
    }

    /// Resolves the SQL text for `dialect`, falling back to the default form.
    pub fn sql_for(&self, dialect: Dialect) -> &'static str {
        match dialect {
            Dialect::Postgres => self.postgres.unwrap_or(self.sql),
            Dialect::Sqlite => self.sqlite.unwrap_or(self.sql),
        }
    }
}

// =============================================================================
// Pool Creation
// =============================================================================

/// Creates a connection pool for one datasource.
///
/// Called once per datasource at startup; the returned pool is `Arc`-based
/// and cheap to clone.
pub async fn create_pool(config: &DatasourceConfig) -> ServiceResult<PgPool> {
    info!(
        datasource = %config.name,
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "creating database connection pool"
    );

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .test_before_acquire(true)
        .connect(&config.url())
        .await
        .map_err(|e| {
            ServiceError::server("SRV-1002", format!("cannot connect to {}: {}", config.name, e))
        })
}

/// Verifies a pool answers a trivial query. Used by the readiness endpoint.
pub async fn health_check(pool: &PgPool) -> ServiceResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

// =============================================================================
// Datasource Set
// =============================================================================

/// The connected pools plus the dialect each one speaks.
#[derive(Debug, Clone)]
pub struct DataSources {
    pub identity: PgPool,
    pub runtime: PgPool,
    pub user: PgPool,
    pub identity_dialect: Dialect,
    pub runtime_dialect: Dialect,
    pub user_dialect: Dialect,
}

impl DataSources {
    /// Connects all three datasources.
    pub async fn connect(config: &DatabaseConfig) -> ServiceResult<Self> {
        Ok(Self {
            identity: create_pool(&config.identity).await?,
            runtime: create_pool(&config.runtime).await?,
            user: create_pool(&config.user).await?,
            identity_dialect: Dialect::from_type(&config.identity.db_type),
            runtime_dialect: Dialect::from_type(&config.runtime.db_type),
            user_dialect: Dialect::from_type(&config.user.db_type),
        })
    }

    /// Closes every pool. Called last during shutdown.
    pub async fn close(&self) {
        self.identity.close().await;
        self.runtime.close().await;
        self.user.close().await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FIND_USER: Query = Query::new(
        "user.find_by_id",
        "SELECT * FROM users WHERE user_id = $1",
    )
    .with_sqlite("SELECT * FROM users WHERE user_id = ?1");

    #[test]
    fn default_form_serves_postgres_without_specialization() {
        assert_eq!(
            FIND_USER.sql_for(Dialect::Postgres),
            "SELECT * FROM users WHERE user_id = $1"
        );
    }

    #[test]
    fn sqlite_specialization_wins_for_sqlite() {
        assert_eq!(
            FIND_USER.sql_for(Dialect::Sqlite),
            "SELECT * FROM users WHERE user_id = ?1"
        );
    }

    #[test]
    fn postgres_specialization_wins_over_default() {
        const Q: Query = Query::new("q", "SELECT now()")
            .with_postgres("SELECT NOW() AT TIME ZONE 'UTC'");
        assert_eq!(Q.sql_for(Dialect::Postgres), "SELECT NOW() AT TIME ZONE 'UTC'");
        assert_eq!(Q.sql_for(Dialect::Sqlite), "SELECT now()");
    }

    #[test]
    fn dialect_parses_from_type_field() {
        assert_eq!(Dialect::from_type("sqlite"), Dialect::Sqlite);
        assert_eq!(Dialect::from_type("postgres"), Dialect::Postgres);
        assert_eq!(Dialect::from_type("anything-else"), Dialect::Postgres);
    }
}
