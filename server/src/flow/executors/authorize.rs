//! Authorization executor: resolves the subset of requested permissions the
//! flow's user actually holds. The engine behind the check is configurable;
//! the default is RBAC through the identity store.

use std::sync::Arc;

use async_trait::async_trait;
use shared::errors::ServiceResult;

use super::{Executor, ExecutorResponse, NodeContext};

/// Permission resolution seam, implemented by the user service (RBAC).
#[async_trait]
pub trait PermissionSource: Send + Sync {
    /// Returns `requested ∩ (user's direct-role ∪ group-role permissions)`.
    async fn authorized_permissions(
        &self,
        user_id: &str,
        group_ids: &[String],
        requested: &[String],
    ) -> ServiceResult<Vec<String>>;
}

pub struct AuthorizeExecutor<P> {
    permissions: Arc<P>,
}

impl<P: PermissionSource> AuthorizeExecutor<P> {
    pub fn new(permissions: Arc<P>) -> Self {
        Self { permissions }
    }

    fn list_property(ctx: &NodeContext, key: &str) -> Vec<String> {
        ctx.properties
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl<P: PermissionSource + 'static> Executor for AuthorizeExecutor<P> {
    fn name(&self) -> &'static str {
        "authorize"
    }

    async fn execute(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
        let Some(user_id) = ctx
            .authenticated_user
            .as_ref()
            .filter(|u| u.is_authenticated)
            .and_then(|u| u.user_id.clone())
        else {
            return Ok(ExecutorResponse::failure(
                "authorization requires an authenticated user",
            ));
        };

        let requested = Self::list_property(ctx, "required_permissions");
        if requested.is_empty() {
            return Ok(ExecutorResponse::complete());
        }
        let group_ids = Self::list_property(ctx, "group_ids");

        let granted = self
            .permissions
            .authorized_permissions(&user_id, &group_ids, &requested)
            .await?;

        // Strict mode: every requested permission must be held.
        let require_all = ctx
            .properties
            .get("require_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if require_all && granted.len() != requested.len() {
            return Ok(ExecutorResponse::failure("insufficient permissions"));
        }

        Ok(ExecutorResponse::complete()
            .with_runtime_data("permissions", granted.join(" ")))
    }
}
