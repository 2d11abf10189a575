//! # Token Repository
//!
//! Runtime-datasource persistence for authorization codes, refresh tokens,
//! and OTP bindings. Codes and tokens are stored as SHA-256 digests; code
//! consumption is an atomic delete-and-return inside a transaction, making
//! every code single-use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use shared::database::{Dialect, Query};
use shared::errors::ServiceResult;
use shared::transaction::{DbSession, TransactionManager};
use uuid::Uuid;

use crate::domain::{AuthorizationCode, RefreshTokenRecord};
use crate::flow::executors::otp::{NewOtpBinding, OtpChallenge, OtpStore};

// =============================================================================
// Authorization Codes
// =============================================================================

const INSERT_CODE: Query = Query::new(
    "authz_code.insert",
    r#"
    INSERT INTO authorization_codes (
        code_hash, client_id, redirect_uri, scope, code_challenge,
        code_challenge_method, user_sub, nonce, expires_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    "#,
);

const CONSUME_CODE: Query = Query::new(
    "authz_code.consume",
    "DELETE FROM authorization_codes WHERE code_hash = $1 RETURNING *",
);

#[derive(Debug, Clone)]
pub struct AuthorizationCodeRepository {
    tm: TransactionManager,
    dialect: Dialect,
}

impl AuthorizationCodeRepository {
    pub fn new(tm: TransactionManager, dialect: Dialect) -> Self {
        Self { tm, dialect }
    }

    pub async fn insert(&self, code: &AuthorizationCode) -> ServiceResult<()> {
        let mut session = self.tm.session();
        session
            .execute(
                sqlx::query(INSERT_CODE.sql_for(self.dialect))
                    .bind(&code.code_hash)
                    .bind(&code.client_id)
                    .bind(&code.redirect_uri)
                    .bind(&code.scope)
                    .bind(&code.code_challenge)
                    .bind(&code.code_challenge_method)
                    .bind(&code.user_sub)
                    .bind(&code.nonce)
                    .bind(code.expires_at),
            )
            .await?;
        Ok(())
    }

    /// Atomically removes and returns the code binding. A second consumption
    /// of the same code sees `None`.
    pub async fn consume(&self, code_hash: &str) -> ServiceResult<Option<AuthorizationCode>> {
        let dialect = self.dialect;
        let code_hash = code_hash.to_string();
        let mut session = self.tm.session();
        self.tm
            .transact(&mut session, move |s: &mut DbSession| {
                async move {
                    Ok(s
                        .fetch_optional(
                            sqlx::query_as::<_, AuthorizationCode>(CONSUME_CODE.sql_for(dialect))
                                .bind(&code_hash),
                        )
                        .await?)
                }
                .boxed()
            })
            .await
    }
}

#[async_trait]
impl crate::service::token_service::CodeStore for AuthorizationCodeRepository {
    async fn insert(&self, code: &AuthorizationCode) -> ServiceResult<()> {
        AuthorizationCodeRepository::insert(self, code).await
    }

    async fn consume(&self, code_hash: &str) -> ServiceResult<Option<AuthorizationCode>> {
        AuthorizationCodeRepository::consume(self, code_hash).await
    }
}

// =============================================================================
// Refresh Tokens
// =============================================================================

const INSERT_REFRESH_TOKEN: Query = Query::new(
    "refresh_token.insert",
    r#"
    INSERT INTO refresh_tokens (id, token_hash, client_id, user_sub, scope, expires_at)
    VALUES ($1, $2, $3, $4, $5, $6)
    RETURNING *
    "#,
);

const SELECT_REFRESH_TOKEN: Query = Query::new(
    "refresh_token.select_by_hash",
    "SELECT * FROM refresh_tokens WHERE token_hash = $1",
);

const REVOKE_REFRESH_TOKEN: Query = Query::new(
    "refresh_token.revoke",
    "UPDATE refresh_tokens SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL",
);

const DELETE_EXPIRED_TOKENS: Query = Query::new(
    "refresh_token.delete_expired",
    "DELETE FROM refresh_tokens WHERE expires_at < $1",
);

#[derive(Debug, Clone)]
pub struct RefreshTokenRepository {
    tm: TransactionManager,
    dialect: Dialect,
}

impl RefreshTokenRepository {
    pub fn new(tm: TransactionManager, dialect: Dialect) -> Self {
        Self { tm, dialect }
    }

    pub async fn insert(
        &self,
        token_hash: &str,
        client_id: &str,
        user_sub: Option<&str>,
        scope: &str,
        expires_at: DateTime<Utc>,
    ) -> ServiceResult<RefreshTokenRecord> {
        let mut session = self.tm.session();
        Ok(session
            .fetch_one(
                sqlx::query_as::<_, RefreshTokenRecord>(INSERT_REFRESH_TOKEN.sql_for(self.dialect))
                    .bind(Uuid::new_v4())
                    .bind(token_hash)
                    .bind(client_id)
                    .bind(user_sub)
                    .bind(scope)
                    .bind(expires_at),
            )
            .await?)
    }

    pub async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> ServiceResult<Option<RefreshTokenRecord>> {
        let mut session = self.tm.session();
        Ok(session
            .fetch_optional(
                sqlx::query_as::<_, RefreshTokenRecord>(SELECT_REFRESH_TOKEN.sql_for(self.dialect))
                    .bind(token_hash),
            )
            .await?)
    }

    pub async fn revoke(&self, id: Uuid) -> ServiceResult<()> {
        let mut session = self.tm.session();
        session
            .execute(sqlx::query(REVOKE_REFRESH_TOKEN.sql_for(self.dialect)).bind(id))
            .await?;
        Ok(())
    }

    /// Periodic cleanup hook; returns the number of rows removed.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> ServiceResult<u64> {
        let mut session = self.tm.session();
        let result = session
            .execute(sqlx::query(DELETE_EXPIRED_TOKENS.sql_for(self.dialect)).bind(now))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl crate::service::token_service::RefreshTokenStore for RefreshTokenRepository {
    async fn insert(
        &self,
        token_hash: &str,
        client_id: &str,
        user_sub: Option<&str>,
        scope: &str,
        expires_at: DateTime<Utc>,
    ) -> ServiceResult<RefreshTokenRecord> {
        RefreshTokenRepository::insert(self, token_hash, client_id, user_sub, scope, expires_at)
            .await
    }

    async fn find_by_hash(&self, token_hash: &str) -> ServiceResult<Option<RefreshTokenRecord>> {
        RefreshTokenRepository::find_by_hash(self, token_hash).await
    }

    async fn revoke(&self, id: Uuid) -> ServiceResult<()> {
        RefreshTokenRepository::revoke(self, id).await
    }
}

// =============================================================================
// OTP Bindings
// =============================================================================

const UPSERT_OTP: Query = Query::new(
    "otp.upsert",
    r#"
    INSERT INTO otp_bindings (
        id, flow_id, user_id, channel, recipient, otp_hash,
        attempt_count, max_attempts, expires_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8)
    ON CONFLICT (flow_id) DO UPDATE
    SET user_id = EXCLUDED.user_id,
        channel = EXCLUDED.channel,
        recipient = EXCLUDED.recipient,
        otp_hash = EXCLUDED.otp_hash,
        attempt_count = 0,
        max_attempts = EXCLUDED.max_attempts,
        expires_at = EXCLUDED.expires_at
    "#,
);

const SELECT_OTP: Query = Query::new(
    "otp.select_by_flow",
    r#"
    SELECT user_id, otp_hash, attempt_count, max_attempts, expires_at
    FROM otp_bindings WHERE flow_id = $1
    "#,
);

const RECORD_OTP_ATTEMPT: Query = Query::new(
    "otp.record_attempt",
    r#"
    UPDATE otp_bindings SET attempt_count = attempt_count + 1
    WHERE flow_id = $1
    RETURNING attempt_count
    "#,
);

const DELETE_OTP: Query = Query::new(
    "otp.delete",
    "DELETE FROM otp_bindings WHERE flow_id = $1",
);

#[derive(sqlx::FromRow)]
struct OtpRow {
    user_id: Uuid,
    otp_hash: String,
    attempt_count: i32,
    max_attempts: i32,
    expires_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    attempt_count: i32,
}

/// SQL-backed [`OtpStore`] for the OTP executors.
#[derive(Debug, Clone)]
pub struct OtpRepository {
    tm: TransactionManager,
    dialect: Dialect,
}

impl OtpRepository {
    pub fn new(tm: TransactionManager, dialect: Dialect) -> Self {
        Self { tm, dialect }
    }
}

#[async_trait]
impl OtpStore for OtpRepository {
    async fn save(&self, binding: NewOtpBinding) -> ServiceResult<()> {
        let mut session = self.tm.session();
        session
            .execute(
                sqlx::query(UPSERT_OTP.sql_for(self.dialect))
                    .bind(Uuid::new_v4())
                    .bind(&binding.flow_id)
                    .bind(binding.user_id)
                    .bind(&binding.channel)
                    .bind(&binding.recipient)
                    .bind(&binding.otp_hash)
                    .bind(binding.max_attempts)
                    .bind(binding.expires_at),
            )
            .await?;
        Ok(())
    }

    async fn find(&self, flow_id: &str) -> ServiceResult<Option<OtpChallenge>> {
        let mut session = self.tm.session();
        let row: Option<OtpRow> = session
            .fetch_optional(
                sqlx::query_as::<_, OtpRow>(SELECT_OTP.sql_for(self.dialect)).bind(flow_id),
            )
            .await?;
        Ok(row.map(|r| OtpChallenge {
            user_id: r.user_id,
            otp_hash: r.otp_hash,
            attempt_count: r.attempt_count,
            max_attempts: r.max_attempts,
            expires_at: r.expires_at,
        }))
    }

    async fn record_attempt(&self, flow_id: &str) -> ServiceResult<i32> {
        let mut session = self.tm.session();
        let row: AttemptRow = session
            .fetch_one(
                sqlx::query_as::<_, AttemptRow>(RECORD_OTP_ATTEMPT.sql_for(self.dialect))
                    .bind(flow_id),
            )
            .await?;
        Ok(row.attempt_count)
    }

    async fn remove(&self, flow_id: &str) -> ServiceResult<()> {
        let mut session = self.tm.session();
        session
            .execute(sqlx::query(DELETE_OTP.sql_for(self.dialect)).bind(flow_id))
            .await?;
        Ok(())
    }
}
