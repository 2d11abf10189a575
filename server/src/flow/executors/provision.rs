//! Provisioning executors for registration flows: create the gathered user
//! and resolve the organization unit that will own it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use shared::errors::{ErrorKind, ServiceResult};

use crate::domain::{OrgUnit, User, RESERVED_ATTRIBUTE_KEYS};
use crate::flow::context::{AuthenticatedUser, FlowType};

use super::{Executor, ExecutorResponse, NodeContext};

// =============================================================================
// Seams
// =============================================================================

/// User creation seam, implemented by the user service.
#[async_trait]
pub trait UserProvisioner: Send + Sync {
    /// Looks the user up by its identifying attributes (`username`, or the
    /// federated `sub`). `None` means the user does not exist yet.
    async fn identify(&self, attributes: &HashMap<String, String>) -> ServiceResult<Option<User>>;

    /// Creates the user. `password` arrives raw and is hashed downstream.
    async fn provision(
        &self,
        ou_id: Option<&str>,
        user_type: &str,
        attributes: HashMap<String, String>,
        password: Option<&str>,
    ) -> ServiceResult<User>;
}

/// Organization-unit resolution seam.
#[async_trait]
pub trait OrgUnitResolver: Send + Sync {
    /// Returns the unit with `handle`, creating it when absent.
    async fn resolve_or_create(&self, handle: &str) -> ServiceResult<OrgUnit>;
}

// =============================================================================
// User Provisioning
// =============================================================================

pub struct ProvisionUserExecutor<P> {
    users: Arc<P>,
}

impl<P: UserProvisioner> ProvisionUserExecutor<P> {
    pub fn new(users: Arc<P>) -> Self {
        Self { users }
    }

    /// The attribute document for the new user: collected runtime data plus
    /// this step's inputs, minus reserved keys and the raw password.
    fn gather_attributes(ctx: &NodeContext) -> HashMap<String, String> {
        let mut attributes: HashMap<String, String> = HashMap::new();
        for (key, value) in ctx.runtime_data.iter().chain(ctx.inputs.iter()) {
            if RESERVED_ATTRIBUTE_KEYS.contains(&key.as_str()) || key == "password" {
                continue;
            }
            attributes.insert(key.clone(), value.clone());
        }
        // The federated subject is carried under a non-reserved key.
        if let Some(sub) = ctx.runtime("sub") {
            attributes.insert("sub".into(), sub.to_string());
        }
        attributes
    }
}

#[async_trait]
impl<P: UserProvisioner + 'static> Executor for ProvisionUserExecutor<P> {
    fn name(&self) -> &'static str {
        "provision_user"
    }

    async fn execute(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
        if ctx.flow_type != FlowType::Registration {
            return Ok(ExecutorResponse::failure(
                "provisioning runs in registration flows only",
            ));
        }

        let attributes = Self::gather_attributes(ctx);
        if attributes.is_empty() {
            return Ok(ExecutorResponse::failure("no attributes collected to provision"));
        }

        // The identify step distinguishes "create new" from "already exists".
        match self.users.identify(&attributes).await {
            Ok(Some(_)) => {
                return Ok(ExecutorResponse::failure("a matching user already exists"))
            }
            Ok(None) => {}
            Err(e) if e.kind == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let ou_id = ctx.runtime("ouId").map(str::to_string);
        let user_type = ctx.property_str("user_type").unwrap_or("person").to_string();
        let password = ctx.input("password").map(str::to_string);

        let user = self
            .users
            .provision(ou_id.as_deref(), &user_type, attributes, password.as_deref())
            .await?;

        let authenticated = AuthenticatedUser::authenticated(user.id.to_string());
        Ok(ExecutorResponse::complete()
            .with_runtime_data("userID", user.id.to_string())
            .with_authenticated_user(authenticated))
    }
}

// =============================================================================
// Organization-Unit Resolution
// =============================================================================

pub struct ProvisionOuExecutor<O> {
    org_units: Arc<O>,
}

impl<O: OrgUnitResolver> ProvisionOuExecutor<O> {
    pub fn new(org_units: Arc<O>) -> Self {
        Self { org_units }
    }
}

#[async_trait]
impl<O: OrgUnitResolver + 'static> Executor for ProvisionOuExecutor<O> {
    fn name(&self) -> &'static str {
        "provision_ou"
    }

    async fn execute(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
        let handle = ctx
            .input("ou")
            .or_else(|| ctx.property_str("ou_handle"))
            .unwrap_or("root")
            .to_string();
        let unit = self.org_units.resolve_or_create(&handle).await?;
        Ok(ExecutorResponse::complete().with_runtime_data("ouId", unit.id.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
