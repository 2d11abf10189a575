//! # User Repository
//!
//! Data access for user records, organization units, and RBAC lookups
//! (user datasource).
//!
//! Attribute matches go through JSONB path operators; the attribute key is
//! always bound, never interpolated.

use shared::database::{Dialect, Query};
use shared::errors::{ServiceError, ServiceResult};
use shared::transaction::DbSession;
use uuid::Uuid;

use crate::domain::{NewUser, OrgUnit, User};

const INSERT_USER: Query = Query::new(
    "user.insert",
    r#"
    INSERT INTO users (id, ou_id, user_type, attributes, credential_hash)
    VALUES ($1, $2, $3, $4, $5)
    RETURNING *
    "#,
);

const SELECT_BY_ID: Query = Query::new(
    "user.select_by_id",
    "SELECT * FROM users WHERE id = $1",
);

const SELECT_BY_ATTRIBUTE: Query = Query::new(
    "user.select_by_attribute",
    "SELECT * FROM users WHERE attributes->>$1 = $2",
);

const UPDATE_USER: Query = Query::new(
    "user.update",
    r#"
    UPDATE users
    SET ou_id = $2, user_type = $3, attributes = $4, updated_at = NOW()
    WHERE id = $1
    RETURNING *
    "#,
);

const UPDATE_CREDENTIAL: Query = Query::new(
    "user.update_credential",
    "UPDATE users SET credential_hash = $2, updated_at = NOW() WHERE id = $1",
);

const DELETE_USER: Query = Query::new(
    "user.delete",
    "DELETE FROM users WHERE id = $1",
);

/// RBAC: permissions reachable through the user's direct roles or the
/// given groups' roles, intersected with the requested set.
const SELECT_AUTHORIZED_PERMISSIONS: Query = Query::new(
    "user.select_authorized_permissions",
    r#"
    SELECT DISTINCT rp.permission
    FROM role_permissions rp
    WHERE rp.permission = ANY($3)
      AND rp.role_id IN (
          SELECT role_id FROM user_roles WHERE user_id = $1
          UNION
          SELECT role_id FROM group_roles WHERE group_id = ANY($2)
      )
    "#,
);

const SELECT_OU_BY_HANDLE: Query = Query::new(
    "org_unit.select_by_handle",
    "SELECT * FROM org_units WHERE handle = $1",
);

const INSERT_OU: Query = Query::new(
    "org_unit.insert",
    r#"
    INSERT INTO org_units (id, handle, name, parent_id)
    VALUES ($1, $2, $3, $4)
    RETURNING *
    "#,
);

#[derive(Debug, Clone)]
pub struct UserRepository {
    dialect: Dialect,
}

impl UserRepository {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    // =========================================================================
    // USERS
    // =========================================================================

    pub async fn create(&self, session: &mut DbSession, new_user: NewUser) -> ServiceResult<User> {
        Ok(session
            .fetch_one(
                sqlx::query_as::<_, User>(INSERT_USER.sql_for(self.dialect))
                    .bind(Uuid::new_v4())
                    .bind(new_user.ou_id)
                    .bind(&new_user.user_type)
                    .bind(&new_user.attributes)
                    .bind(&new_user.credential_hash),
            )
            .await?)
    }

    pub async fn get_by_id(
        &self,
        session: &mut DbSession,
        id: Uuid,
    ) -> ServiceResult<Option<User>> {
        Ok(session
            .fetch_optional(sqlx::query_as::<_, User>(SELECT_BY_ID.sql_for(self.dialect)).bind(id))
            .await?)
    }

    /// First user whose attribute document has `key` = `value`.
    pub async fn find_by_attribute(
        &self,
        session: &mut DbSession,
        key: &str,
        value: &str,
    ) -> ServiceResult<Option<User>> {
        Ok(session
            .fetch_optional(
                sqlx::query_as::<_, User>(SELECT_BY_ATTRIBUTE.sql_for(self.dialect))
                    .bind(key)
                    .bind(value),
            )
            .await?)
    }

    pub async fn update(&self, session: &mut DbSession, user: &User) -> ServiceResult<User> {
        Ok(session
            .fetch_one(
                sqlx::query_as::<_, User>(UPDATE_USER.sql_for(self.dialect))
                    .bind(user.id)
                    .bind(user.ou_id)
                    .bind(&user.user_type)
                    .bind(&user.attributes),
            )
            .await?)
    }

    pub async fn update_credential(
        &self,
        session: &mut DbSession,
        id: Uuid,
        credential_hash: Option<&str>,
    ) -> ServiceResult<()> {
        let result = session
            .execute(
                sqlx::query(UPDATE_CREDENTIAL.sql_for(self.dialect))
                    .bind(id)
                    .bind(credential_hash),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found("USR-1001", "user does not exist"));
        }
        Ok(())
    }

    pub async fn delete(&self, session: &mut DbSession, id: Uuid) -> ServiceResult<bool> {
        let result = session
            .execute(sqlx::query(DELETE_USER.sql_for(self.dialect)).bind(id))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // RBAC
    // =========================================================================

    pub async fn authorized_permissions(
        &self,
        session: &mut DbSession,
        user_id: Uuid,
        group_ids: &[Uuid],
        requested: &[String],
    ) -> ServiceResult<Vec<String>> {
        if requested.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<PermissionRow> = session
            .fetch_all(
                sqlx::query_as::<_, PermissionRow>(
                    SELECT_AUTHORIZED_PERMISSIONS.sql_for(self.dialect),
                )
                .bind(user_id)
                .bind(group_ids)
                .bind(requested),
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.permission).collect())
    }

    // =========================================================================
    // ORGANIZATION UNITS
    // =========================================================================

    pub async fn get_ou_by_handle(
        &self,
        session: &mut DbSession,
        handle: &str,
    ) -> ServiceResult<Option<OrgUnit>> {
        Ok(session
            .fetch_optional(
                sqlx::query_as::<_, OrgUnit>(SELECT_OU_BY_HANDLE.sql_for(self.dialect))
                    .bind(handle),
            )
            .await?)
    }

    pub async fn create_ou(
        &self,
        session: &mut DbSession,
        handle: &str,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> ServiceResult<OrgUnit> {
        Ok(session
            .fetch_one(
                sqlx::query_as::<_, OrgUnit>(INSERT_OU.sql_for(self.dialect))
                    .bind(Uuid::new_v4())
                    .bind(handle)
                    .bind(name)
                    .bind(parent_id),
            )
            .await?)
    }
}

#[derive(sqlx::FromRow)]
struct PermissionRow {
    permission: String,
}
