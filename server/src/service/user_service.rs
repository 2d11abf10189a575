//! # User Service
//!
//! Business logic for the identity store: user CRUD, credential
//! verification, organization-unit attribution, and RBAC permission
//! resolution. Implements the narrow seams the flow executors consume.
//!
//! Unknown-user reads return the well-known `USR-1001` not-found error;
//! registration flows rely on it to distinguish "create new" from
//! "already exists".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use shared::crypto::CredentialHasher;
use shared::errors::{ServiceError, ServiceResult};
use shared::observability::{Event, EventBus, EventStatus};
use shared::transaction::{DbSession, TransactionManager};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{NewUser, OrgUnit, User, RESERVED_ATTRIBUTE_KEYS};
use crate::flow::executors::authorize::PermissionSource;
use crate::flow::executors::credentials::CredentialsAuth;
use crate::flow::executors::oidc::FederatedUserResolver;
use crate::flow::executors::otp::OtpUserResolver;
use crate::flow::executors::provision::{OrgUnitResolver, UserProvisioner};
use crate::repository::UserRepository;

/// Handle of the implicit root organization unit.
const ROOT_OU_HANDLE: &str = "root";

// =============================================================================
// Requests
// =============================================================================

/// Create/update payload accepted by the service layer.
#[derive(Debug, Clone)]
pub struct UserUpsert {
    pub ou_handle: Option<String>,
    pub user_type: String,
    pub attributes: Value,
    pub password: Option<String>,
}

// =============================================================================
// Service
// =============================================================================

pub struct UserService {
    tm: TransactionManager,
    repo: UserRepository,
    hasher: Arc<CredentialHasher>,
    bus: EventBus,
}

impl UserService {
    pub fn new(
        tm: TransactionManager,
        repo: UserRepository,
        hasher: Arc<CredentialHasher>,
        bus: EventBus,
    ) -> Self {
        Self { tm, repo, hasher, bus }
    }

    /// Drops reserved runtime keys from an attribute document before it is
    /// persisted.
    pub fn sanitize_attributes(attributes: Value) -> Value {
        match attributes {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(key, _)| !RESERVED_ATTRIBUTE_KEYS.contains(&key.as_str()))
                    .collect(),
            ),
            other => other,
        }
    }

    pub async fn create_user(&self, request: UserUpsert) -> ServiceResult<User> {
        let attributes = Self::sanitize_attributes(request.attributes);
        let credential_hash = match &request.password {
            Some(password) => Some(self.hasher.hash(password)?),
            None => None,
        };
        let ou_handle = request.ou_handle.unwrap_or_else(|| ROOT_OU_HANDLE.to_string());
        let user_type = request.user_type.clone();

        let repo = self.repo.clone();
        let mut session = self.tm.session();
        let user = self
            .tm
            .transact(&mut session, move |s: &mut DbSession| {
                async move {
                    let ou = match repo.get_ou_by_handle(s, &ou_handle).await? {
                        Some(ou) => ou,
                        None => repo.create_ou(s, &ou_handle, &ou_handle, None).await?,
                    };
                    repo.create(
                        s,
                        NewUser { ou_id: ou.id, user_type, attributes, credential_hash },
                    )
                    .await
                }
                .boxed()
            })
            .await?;

        info!(user_id = %user.id, ou_id = %user.ou_id, "user created");
        self.bus.publish(
            Event::new("user.created", "user-service")
                .with_status(EventStatus::Success)
                .with_data(serde_json::json!({"user_id": user.id, "type": user.user_type})),
        );
        Ok(user)
    }

    pub async fn get_user(&self, id: Uuid) -> ServiceResult<User> {
        let mut session = self.tm.session();
        self.repo
            .get_by_id(&mut session, id)
            .await?
            .ok_or_else(|| ServiceError::not_found("USR-1001", "user does not exist"))
    }

    pub async fn update_user(&self, id: Uuid, request: UserUpsert) -> ServiceResult<User> {
        let mut user = self.get_user(id).await?;
        user.user_type = request.user_type;
        user.attributes = Self::sanitize_attributes(request.attributes);

        let mut session = self.tm.session();
        if let Some(handle) = request.ou_handle {
            let ou = self
                .repo
                .get_ou_by_handle(&mut session, &handle)
                .await?
                .ok_or_else(|| ServiceError::not_found("OU-1001", "organization unit does not exist"))?;
            user.ou_id = ou.id;
        }
        let updated = self.repo.update(&mut session, &user).await?;

        if let Some(password) = request.password {
            let hash = self.hasher.hash(&password)?;
            self.repo
                .update_credential(&mut session, id, Some(&hash))
                .await?;
        }

        self.bus.publish(
            Event::new("user.updated", "user-service")
                .with_status(EventStatus::Success)
                .with_data(serde_json::json!({"user_id": id})),
        );
        Ok(updated)
    }

    pub async fn delete_user(&self, id: Uuid) -> ServiceResult<()> {
        let mut session = self.tm.session();
        if !self.repo.delete(&mut session, id).await? {
            return Err(ServiceError::not_found("USR-1001", "user does not exist"));
        }
        self.bus.publish(
            Event::new("user.deleted", "user-service")
                .with_status(EventStatus::Success)
                .with_data(serde_json::json!({"user_id": id})),
        );
        Ok(())
    }

    pub async fn find_by_username(&self, username: &str) -> ServiceResult<Option<User>> {
        let mut session = self.tm.session();
        self.repo
            .find_by_attribute(&mut session, "username", username)
            .await
    }

    /// RBAC: `requested ∩ (direct-role ∪ group-role permissions)`.
    pub async fn get_authorized_permissions(
        &self,
        user_id: Uuid,
        group_ids: &[Uuid],
        requested: &[String],
    ) -> ServiceResult<Vec<String>> {
        let mut session = self.tm.session();
        self.repo
            .authorized_permissions(&mut session, user_id, group_ids, requested)
            .await
    }
}

// =============================================================================
// Executor Seams
// =============================================================================

#[async_trait]
impl CredentialsAuth for UserService {
    async fn verify_credentials(&self, username: &str, password: &str) -> ServiceResult<User> {
        // One error for unknown user and wrong password alike, to prevent
        // account enumeration.
        let invalid = || ServiceError::client("CRD-1001", "invalid username or password");

        let user = match self.find_by_username(username).await? {
            Some(user) => user,
            None => {
                warn!(username = %username, "login attempt for unknown user");
                return Err(invalid());
            }
        };
        let verifier = user.credential_hash.clone().ok_or_else(invalid)?;
        if !self.hasher.verify(password, &verifier)? {
            warn!(user_id = %user.id, "failed credential verification");
            return Err(invalid());
        }
        Ok(user)
    }
}

#[async_trait]
impl OtpUserResolver for UserService {
    async fn resolve_user(&self, username: &str) -> ServiceResult<User> {
        self.find_by_username(username)
            .await?
            .ok_or_else(|| ServiceError::not_found("USR-1001", "user does not exist"))
    }
}

#[async_trait]
impl FederatedUserResolver for UserService {
    async fn find_by_subject(&self, _idp: &str, subject: &str) -> ServiceResult<Option<User>> {
        let mut session = self.tm.session();
        self.repo.find_by_attribute(&mut session, "sub", subject).await
    }
}

#[async_trait]
impl UserProvisioner for UserService {
    async fn identify(&self, attributes: &HashMap<String, String>) -> ServiceResult<Option<User>> {
        if let Some(username) = attributes.get("username") {
            if let Some(user) = self.find_by_username(username).await? {
                return Ok(Some(user));
            }
        }
        if let Some(subject) = attributes.get("sub") {
            return self.find_by_subject("", subject).await;
        }
        Ok(None)
    }

    async fn provision(
        &self,
        ou_id: Option<&str>,
        user_type: &str,
        attributes: HashMap<String, String>,
        password: Option<&str>,
    ) -> ServiceResult<User> {
        // A pre-resolved OU id wins over handle resolution.
        let ou_handle = match ou_id {
            Some(_) => None,
            None => Some(ROOT_OU_HANDLE.to_string()),
        };
        let mut document = serde_json::Map::new();
        for (key, value) in attributes {
            document.insert(key, Value::String(value));
        }

        let mut user = self
            .create_user(UserUpsert {
                ou_handle,
                user_type: user_type.to_string(),
                attributes: Value::Object(document),
                password: password.map(str::to_string),
            })
            .await?;

        if let Some(ou_id) = ou_id.and_then(|s| Uuid::parse_str(s).ok()) {
            let mut session = self.tm.session();
            user.ou_id = ou_id;
            user = self.repo.update(&mut session, &user).await?;
        }
        Ok(user)
    }
}

#[async_trait]
impl OrgUnitResolver for UserService {
    async fn resolve_or_create(&self, handle: &str) -> ServiceResult<OrgUnit> {
        let mut session = self.tm.session();
        match self.repo.get_ou_by_handle(&mut session, handle).await? {
            Some(ou) => Ok(ou),
            None => self.repo.create_ou(&mut session, handle, handle, None).await,
        }
    }
}

#[async_trait]
impl super::token_service::SubjectSource for UserService {
    async fn attributes_for(&self, sub: &str) -> ServiceResult<serde_json::Value> {
        let id = Uuid::parse_str(sub)
            .map_err(|_| ServiceError::not_found("USR-1001", "user does not exist"))?;
        Ok(self.get_user(id).await?.attributes)
    }
}

#[async_trait]
impl PermissionSource for UserService {
    async fn authorized_permissions(
        &self,
        user_id: &str,
        group_ids: &[String],
        requested: &[String],
    ) -> ServiceResult<Vec<String>> {
        let user_id = Uuid::parse_str(user_id)
            .map_err(|_| ServiceError::invalid_request("user id is not a UUID"))?;
        let group_ids: Vec<Uuid> = group_ids
            .iter()
            .filter_map(|g| Uuid::parse_str(g).ok())
            .collect();
        self.get_authorized_permissions(user_id, &group_ids, requested)
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================
