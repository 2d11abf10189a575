//! # Application Service
//!
//! Management of registered OAuth2 applications, backed by the identity
//! datasource with a read-through TTL cache on the hot `client_id` lookup
//! used by client authentication.

use std::sync::Arc;

use async_trait::async_trait;
use shared::cache::TtlCache;
use shared::config::CacheConfig;
use shared::crypto::CredentialHasher;
use shared::errors::{ServiceError, ServiceResult};
use shared::observability::{Event, EventBus, EventStatus};
use shared::transaction::TransactionManager;
use tracing::info;
use uuid::Uuid;

use crate::domain::{Application, NewApplication};
use crate::repository::ApplicationRepository;

use super::client_auth::ApplicationLookup;

/// Create/update payload. The client secret arrives raw and is stored only
/// as its Argon2 verifier.
#[derive(Debug, Clone)]
pub struct ApplicationUpsert {
    pub name: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub grant_types: Vec<String>,
    pub token_auth_methods: Vec<String>,
    pub redirect_uris: Vec<String>,
    pub scopes: Vec<String>,
    pub scope_claims: serde_json::Value,
    pub id_token_user_attributes: Vec<String>,
    pub auth_flow_id: Option<String>,
}

/// Invariant checks shared by create and update.
fn validate_upsert(request: &ApplicationUpsert) -> ServiceResult<()> {
    if request.name.trim().is_empty() {
        return Err(ServiceError::client("APP-1001", "application name cannot be empty"));
    }
    if request.client_id.trim().is_empty() {
        return Err(ServiceError::client("APP-1001", "client_id cannot be empty"));
    }
    if request.token_auth_methods.is_empty() {
        return Err(ServiceError::client(
            "APP-1003",
            "at least one token-endpoint auth method is required",
        ));
    }
    let public = request.token_auth_methods.iter().any(|m| m == "none");
    if !public && request.client_secret.is_none() {
        return Err(ServiceError::client(
            "APP-1004",
            "confidential clients require a client secret",
        ));
    }
    Ok(())
}

pub struct ApplicationService {
    tm: TransactionManager,
    repo: ApplicationRepository,
    hasher: Arc<CredentialHasher>,
    cache: TtlCache<String, Application>,
    bus: EventBus,
}

impl ApplicationService {
    pub fn new(
        tm: TransactionManager,
        repo: ApplicationRepository,
        hasher: Arc<CredentialHasher>,
        cache_config: &CacheConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            tm,
            repo,
            hasher,
            cache: TtlCache::from_config(cache_config),
            bus,
        }
    }

    pub async fn create(&self, request: ApplicationUpsert) -> ServiceResult<Application> {
        validate_upsert(&request)?;
        let client_secret_hash = match &request.client_secret {
            Some(secret) => Some(self.hasher.hash(secret)?),
            None => None,
        };

        let mut session = self.tm.session();
        let app = self
            .repo
            .create(
                &mut session,
                NewApplication {
                    name: request.name,
                    client_id: request.client_id,
                    client_secret_hash,
                    grant_types: request.grant_types,
                    token_auth_methods: request.token_auth_methods,
                    redirect_uris: request.redirect_uris,
                    scopes: request.scopes,
                    scope_claims: request.scope_claims,
                    id_token_user_attributes: request.id_token_user_attributes,
                    auth_flow_id: request.auth_flow_id,
                },
            )
            .await?;

        info!(app_id = %app.id, client_id = %app.client_id, "application registered");
        self.bus.publish(
            Event::new("application.created", "application-service")
                .with_status(EventStatus::Success)
                .with_data(serde_json::json!({"app_id": app.id, "client_id": app.client_id})),
        );
        Ok(app)
    }

    pub async fn get(&self, id: Uuid) -> ServiceResult<Application> {
        let mut session = self.tm.session();
        self.repo
            .get_by_id(&mut session, id)
            .await?
            .ok_or_else(|| ServiceError::not_found("APP-1005", "application does not exist"))
    }

    pub async fn get_by_client_id(&self, client_id: &str) -> ServiceResult<Option<Application>> {
        if let Some(app) = self.cache.get(&client_id.to_string()) {
            return Ok(Some(app));
        }
        let mut session = self.tm.session();
        let app = self.repo.get_by_client_id(&mut session, client_id).await?;
        if let Some(app) = &app {
            self.cache.put(client_id.to_string(), app.clone());
        }
        Ok(app)
    }

    pub async fn list(&self) -> ServiceResult<Vec<Application>> {
        let mut session = self.tm.session();
        self.repo.list(&mut session).await
    }

    pub async fn update(&self, id: Uuid, request: ApplicationUpsert) -> ServiceResult<Application> {
        validate_upsert(&request)?;
        let mut app = self.get(id).await?;
        app.name = request.name;
        app.grant_types = request.grant_types;
        app.token_auth_methods = request.token_auth_methods;
        app.redirect_uris = request.redirect_uris;
        app.scopes = request.scopes;
        app.scope_claims = request.scope_claims;
        app.id_token_user_attributes = request.id_token_user_attributes;
        app.auth_flow_id = request.auth_flow_id;

        let mut session = self.tm.session();
        let updated = self.repo.update(&mut session, &app).await?;
        self.cache.invalidate(&updated.client_id);
        self.bus.publish(
            Event::new("application.updated", "application-service")
                .with_status(EventStatus::Success)
                .with_data(serde_json::json!({"app_id": id})),
        );
        Ok(updated)
    }

    pub async fn delete(&self, id: Uuid) -> ServiceResult<()> {
        let app = self.get(id).await?;
        let mut session = self.tm.session();
        if !self.repo.delete(&mut session, id).await? {
            return Err(ServiceError::not_found("APP-1005", "application does not exist"));
        }
        self.cache.invalidate(&app.client_id);
        self.bus.publish(
            Event::new("application.deleted", "application-service")
                .with_status(EventStatus::Success)
                .with_data(serde_json::json!({"app_id": id})),
        );
        Ok(())
    }
}

#[async_trait]
impl ApplicationLookup for ApplicationService {
    async fn by_client_id(&self, client_id: &str) -> ServiceResult<Option<Application>> {
        self.get_by_client_id(client_id).await
    }
}

// =============================================================================
// Tests
// =============================================================================
