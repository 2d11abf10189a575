//! # Application Repository
//!
//! Data access for registered OAuth2 applications (identity datasource).
//! All statements are dialected [`Query`] records; callers hand in the
//! session so services can compose repository calls inside one transaction.

use shared::database::{Dialect, Query};
use shared::errors::{ServiceError, ServiceResult};
use shared::transaction::DbSession;
use uuid::Uuid;

use crate::domain::{Application, NewApplication};

const INSERT_APPLICATION: Query = Query::new(
    "application.insert",
    r#"
    INSERT INTO applications (
        id, name, client_id, client_secret_hash, grant_types,
        token_auth_methods, redirect_uris, scopes, scope_claims,
        id_token_user_attributes, auth_flow_id
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    RETURNING *
    "#,
);

const SELECT_BY_ID: Query = Query::new(
    "application.select_by_id",
    "SELECT * FROM applications WHERE id = $1",
);

const SELECT_BY_CLIENT_ID: Query = Query::new(
    "application.select_by_client_id",
    "SELECT * FROM applications WHERE client_id = $1",
);

const SELECT_ALL: Query = Query::new(
    "application.select_all",
    "SELECT * FROM applications ORDER BY created_at",
);

const UPDATE_APPLICATION: Query = Query::new(
    "application.update",
    r#"
    UPDATE applications
    SET name = $2,
        grant_types = $3,
        token_auth_methods = $4,
        redirect_uris = $5,
        scopes = $6,
        scope_claims = $7,
        id_token_user_attributes = $8,
        auth_flow_id = $9,
        updated_at = NOW()
    WHERE id = $1
    RETURNING *
    "#,
);

const DELETE_APPLICATION: Query = Query::new(
    "application.delete",
    "DELETE FROM applications WHERE id = $1",
);

#[derive(Debug, Clone)]
pub struct ApplicationRepository {
    dialect: Dialect,
}

impl ApplicationRepository {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub async fn create(
        &self,
        session: &mut DbSession,
        new_app: NewApplication,
    ) -> ServiceResult<Application> {
        session
            .fetch_one(
                sqlx::query_as::<_, Application>(INSERT_APPLICATION.sql_for(self.dialect))
                    .bind(Uuid::new_v4())
                    .bind(&new_app.name)
                    .bind(&new_app.client_id)
                    .bind(&new_app.client_secret_hash)
                    .bind(&new_app.grant_types)
                    .bind(&new_app.token_auth_methods)
                    .bind(&new_app.redirect_uris)
                    .bind(&new_app.scopes)
                    .bind(&new_app.scope_claims)
                    .bind(&new_app.id_token_user_attributes)
                    .bind(&new_app.auth_flow_id),
            )
            .await
            .map_err(|e| match constraint(&e) {
                Some("applications_client_id_key") => {
                    ServiceError::conflict("APP-1002", "client_id already registered")
                }
                _ => e.into(),
            })
    }

    pub async fn get_by_id(
        &self,
        session: &mut DbSession,
        id: Uuid,
    ) -> ServiceResult<Option<Application>> {
        Ok(session
            .fetch_optional(
                sqlx::query_as::<_, Application>(SELECT_BY_ID.sql_for(self.dialect)).bind(id),
            )
            .await?)
    }

    pub async fn get_by_client_id(
        &self,
        session: &mut DbSession,
        client_id: &str,
    ) -> ServiceResult<Option<Application>> {
        Ok(session
            .fetch_optional(
                sqlx::query_as::<_, Application>(SELECT_BY_CLIENT_ID.sql_for(self.dialect))
                    .bind(client_id),
            )
            .await?)
    }

    pub async fn list(&self, session: &mut DbSession) -> ServiceResult<Vec<Application>> {
        Ok(session
            .fetch_all(sqlx::query_as::<_, Application>(SELECT_ALL.sql_for(self.dialect)))
            .await?)
    }

    /// Full update of the mutable fields. Client credentials rotate through
    /// a dedicated service path, not here.
    pub async fn update(
        &self,
        session: &mut DbSession,
        app: &Application,
    ) -> ServiceResult<Application> {
        Ok(session
            .fetch_one(
                sqlx::query_as::<_, Application>(UPDATE_APPLICATION.sql_for(self.dialect))
                    .bind(app.id)
                    .bind(&app.name)
                    .bind(&app.grant_types)
                    .bind(&app.token_auth_methods)
                    .bind(&app.redirect_uris)
                    .bind(&app.scopes)
                    .bind(&app.scope_claims)
                    .bind(&app.id_token_user_attributes)
                    .bind(&app.auth_flow_id),
            )
            .await?)
    }

    /// Returns `true` when a row was removed.
    pub async fn delete(&self, session: &mut DbSession, id: Uuid) -> ServiceResult<bool> {
        let result = session
            .execute(sqlx::query(DELETE_APPLICATION.sql_for(self.dialect)).bind(id))
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn constraint(e: &sqlx::Error) -> Option<&str> {
    match e {
        sqlx::Error::Database(db_err) => db_err.constraint(),
        _ => None,
    }
}
