//! # Transaction Manager
//!
//! Nestable transactional scope bound to a database session.
//!
//! ## Contract
//!
//! [`TransactionManager::transact`] runs a closure with a [`DbSession`] that
//! carries a live transaction:
//!
//! - If the session already carries one, the closure runs on it without
//!   opening a new transaction (flat nesting).
//! - If the closure returns an error, the transaction is rolled back; a
//!   rollback failure is joined onto the primary error, never replacing it.
//! - If the closure panics, the panic is caught, the transaction is rolled
//!   back, the stack trace is logged, and a server-kind error is returned.
//! - On success the transaction is committed.
//!
//! Queries issued through a session run on the bound transaction when
//! present, otherwise against the pooled connection.
//!
//! ## Task safety
//!
//! A session is **not** safe to share across spawned tasks: the bound
//! transaction is a single connection. Tasks spawned inside `transact` must
//! open their own session from the pool.

use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::{Query as SqlxQuery, QueryAs};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use tracing::error;

use crate::errors::{ServiceError, ServiceResult};

// =============================================================================
// Session
// =============================================================================

/// A database session: either the pool itself or a live transaction.
pub struct DbSession {
    conn: SessionConn,
}

enum SessionConn {
    Pool(PgPool),
    Tx(Transaction<'static, Postgres>),
}

impl DbSession {
    /// A pool-backed session with no open transaction.
    pub fn new(pool: PgPool) -> Self {
        Self { conn: SessionConn::Pool(pool) }
    }

    /// Whether this session currently carries a transaction.
    pub fn in_transaction(&self) -> bool {
        matches!(self.conn, SessionConn::Tx(_))
    }

    /// Runs a row-mapping query, expecting exactly one row.
    pub async fn fetch_one<T>(
        &mut self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<T, sqlx::Error>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        match &mut self.conn {
            SessionConn::Pool(pool) => query.fetch_one(&*pool).await,
            SessionConn::Tx(tx) => query.fetch_one(&mut **tx).await,
        }
    }

    /// Runs a row-mapping query, yielding zero or one row.
    pub async fn fetch_optional<T>(
        &mut self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<Option<T>, sqlx::Error>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        match &mut self.conn {
            SessionConn::Pool(pool) => query.fetch_optional(&*pool).await,
            SessionConn::Tx(tx) => query.fetch_optional(&mut **tx).await,
        }
    }

    /// Runs a row-mapping query, yielding all rows.
    pub async fn fetch_all<T>(
        &mut self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<Vec<T>, sqlx::Error>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        match &mut self.conn {
            SessionConn::Pool(pool) => query.fetch_all(&*pool).await,
            SessionConn::Tx(tx) => query.fetch_all(&mut **tx).await,
        }
    }

    /// Runs a statement, returning the affected-row summary.
    pub async fn execute(
        &mut self,
        query: SqlxQuery<'_, Postgres, PgArguments>,
    ) -> Result<PgQueryResult, sqlx::Error> {
        match &mut self.conn {
            SessionConn::Pool(pool) => query.execute(&*pool).await,
            SessionConn::Tx(tx) => query.execute(&mut **tx).await,
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Opens transactions on one datasource's pool.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    pool: PgPool,
}

impl TransactionManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A fresh pool-backed session.
    pub fn session(&self) -> DbSession {
        DbSession::new(self.pool.clone())
    }

    /// Runs `f` inside a transaction on `session`.
    ///
    /// See the module docs for the commit / rollback / panic semantics.
    /// Flat nesting: when `session` already carries a transaction, `f` runs
    /// directly on it and the outermost `transact` call owns the commit.
    pub async fn transact<T, F>(&self, session: &mut DbSession, f: F) -> ServiceResult<T>
    where
        F: for<'a> FnOnce(&'a mut DbSession) -> BoxFuture<'a, ServiceResult<T>>,
    {
        if session.in_transaction() {
            return f(session).await;
        }

        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ServiceError::server("SRV-1003", format!("cannot begin transaction: {}", e)))?;

        let prior = std::mem::replace(&mut session.conn, SessionConn::Tx(tx));
        let outcome = AssertUnwindSafe(f(session)).catch_unwind().await;
        let bound = std::mem::replace(&mut session.conn, prior);

        let tx = match bound {
            SessionConn::Tx(tx) => tx,
            SessionConn::Pool(_) => {
                return Err(ServiceError::server(
                    "SRV-1004",
                    "transaction state lost during scope",
                ));
            }
        };

        match outcome {
            Ok(Ok(value)) => {
                tx.commit().await.map_err(|e| {
                    ServiceError::server("SRV-1005", format!("commit failed: {}", e))
                })?;
                Ok(value)
            }
            Ok(Err(primary)) => {
                let mut primary = primary;
                if let Err(rb) = tx.rollback().await {
                    // Joined, never replacing the primary error.
                    primary.description = format!("{}; rollback failed: {}", primary.description, rb);
                }
                Err(primary)
            }
            Err(panic) => {
                let reason = panic_message(panic);
                let backtrace = Backtrace::force_capture();
                error!(reason = %reason, stack = %backtrace, "panic inside transaction");
                let mut err = ServiceError::server(
                    "SRV-1006",
                    format!("panic inside transaction: {} (stack trace logged)", reason),
                );
                if let Err(rb) = tx.rollback().await {
                    err.description = format!("{}; rollback failed: {}", err.description, rb);
                }
                Err(err)
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
