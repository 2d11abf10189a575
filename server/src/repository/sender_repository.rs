//! # Notification-Sender Repository
//!
//! Identity-datasource persistence for configured notification senders.
//! The property bag (provider credentials included) is encrypted at rest
//! with pgcrypto's symmetric PGP functions; the key comes from the
//! deployment's `security.crypto_file`.

use shared::database::{Dialect, Query};
use shared::errors::{ServiceError, ServiceResult};
use shared::transaction::DbSession;
use uuid::Uuid;

use crate::service::notification::SenderConfig;

const UPSERT_SENDER: Query = Query::new(
    "sender.upsert",
    r#"
    INSERT INTO notification_senders (id, name, provider, properties_enc)
    VALUES ($1, $2, $3, pgp_sym_encrypt($4, $5))
    ON CONFLICT (name) DO UPDATE
    SET provider = EXCLUDED.provider,
        properties_enc = EXCLUDED.properties_enc
    "#,
);

const SELECT_ALL_SENDERS: Query = Query::new(
    "sender.select_all",
    r#"
    SELECT id, name, provider, pgp_sym_decrypt(properties_enc, $1) AS properties
    FROM notification_senders
    ORDER BY name
    "#,
);

const DELETE_SENDER: Query = Query::new(
    "sender.delete",
    "DELETE FROM notification_senders WHERE name = $1",
);

#[derive(sqlx::FromRow)]
struct SenderRow {
    #[allow(dead_code)]
    id: Uuid,
    name: String,
    provider: String,
    /// Decrypted JSON property bag.
    properties: String,
}

#[derive(Debug, Clone)]
pub struct SenderRepository {
    dialect: Dialect,
    /// Symmetric key for the at-rest encryption of property bags.
    crypto_key: String,
}

impl SenderRepository {
    pub fn new(dialect: Dialect, crypto_key: String) -> Self {
        Self { dialect, crypto_key }
    }

    pub async fn upsert(
        &self,
        session: &mut DbSession,
        config: &SenderConfig,
    ) -> ServiceResult<()> {
        let properties = serde_json::to_string(&config.properties)?;
        session
            .execute(
                sqlx::query(UPSERT_SENDER.sql_for(self.dialect))
                    .bind(Uuid::new_v4())
                    .bind(&config.name)
                    .bind(&config.provider)
                    .bind(properties)
                    .bind(&self.crypto_key),
            )
            .await?;
        Ok(())
    }

    pub async fn list(&self, session: &mut DbSession) -> ServiceResult<Vec<SenderConfig>> {
        let rows: Vec<SenderRow> = session
            .fetch_all(
                sqlx::query_as::<_, SenderRow>(SELECT_ALL_SENDERS.sql_for(self.dialect))
                    .bind(&self.crypto_key),
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                let properties = serde_json::from_str(&row.properties).map_err(|e| {
                    ServiceError::server(
                        "NTF-1006",
                        format!("corrupt sender property bag for '{}': {}", row.name, e),
                    )
                })?;
                Ok(SenderConfig { name: row.name, provider: row.provider, properties })
            })
            .collect()
    }

    pub async fn delete(&self, session: &mut DbSession, name: &str) -> ServiceResult<bool> {
        let result = session
            .execute(sqlx::query(DELETE_SENDER.sql_for(self.dialect)).bind(name))
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
