//! # Executors
//!
//! An executor implements a single step of a flow. Given a [`NodeContext`]
//! it returns an [`ExecutorResponse`]; executors are pure given their inputs
//! plus the services they hold: they never mutate the graph, and the engine
//! merges their context mutations back into the flow context.
//!
//! | Executor        | Step                                               |
//! |-----------------|----------------------------------------------------|
//! | `credentials`   | username/password verification                     |
//! | `sms_otp` / `email_otp` | two-phase one-time-password challenge      |
//! | `oidc` / `google_oidc` / `github_oauth` | federated login            |
//! | `attribute_collector` | prompt for required attributes               |
//! | `provision_user`| create the user a registration flow gathered       |
//! | `provision_ou`  | resolve/create the owning organization unit        |
//! | `authorize`     | RBAC permission resolution                         |
//! | `auth_assert`   | mint the flow-completion assertion                 |

pub mod assert;
pub mod attribute;
pub mod authorize;
pub mod credentials;
pub mod oidc;
pub mod otp;
pub mod provision;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use shared::errors::{ServiceError, ServiceResult};

use super::context::{AuthenticatedUser, FlowType};

// =============================================================================
// Status & Response
// =============================================================================

/// Outcome classification of one executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorStatus {
    Complete,
    UserInputRequired,
    ExternalRedirection,
    Retry,
    Failure,
}

impl ExecutorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::UserInputRequired => "USER_INPUT_REQUIRED",
            Self::ExternalRedirection => "EXTERNAL_REDIRECTION",
            Self::Retry => "RETRY",
            Self::Failure => "FAILURE",
        }
    }
}

/// What an executor hands back to the engine.
#[derive(Debug, Clone, Default)]
pub struct ExecutorResponse {
    pub status: Option<ExecutorStatus>,
    /// Inputs the client still has to supply.
    pub required_data: Vec<String>,
    /// Values merged into the flow's runtime data.
    pub runtime_data: HashMap<String, String>,
    /// Extra data surfaced to the client with the step response.
    pub additional_data: HashMap<String, String>,
    pub redirect_url: Option<String>,
    pub authenticated_user: Option<AuthenticatedUser>,
    pub assertion: Option<String>,
    pub failure_reason: Option<String>,
}

impl ExecutorResponse {
    pub fn complete() -> Self {
        Self { status: Some(ExecutorStatus::Complete), ..Default::default() }
    }

    pub fn user_input_required(fields: Vec<String>) -> Self {
        Self {
            status: Some(ExecutorStatus::UserInputRequired),
            required_data: fields,
            ..Default::default()
        }
    }

    pub fn external_redirect(url: impl Into<String>) -> Self {
        Self {
            status: Some(ExecutorStatus::ExternalRedirection),
            redirect_url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            status: Some(ExecutorStatus::Retry),
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: Some(ExecutorStatus::Failure),
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// The status, defaulting malformed responses to failure.
    pub fn status(&self) -> ExecutorStatus {
        self.status.unwrap_or(ExecutorStatus::Failure)
    }

    pub fn with_runtime_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.runtime_data.insert(key.into(), value.into());
        self
    }

    pub fn with_additional_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_data.insert(key.into(), value.into());
        self
    }

    pub fn with_authenticated_user(mut self, user: AuthenticatedUser) -> Self {
        self.authenticated_user = Some(user);
        self
    }

    pub fn with_assertion(mut self, assertion: impl Into<String>) -> Self {
        self.assertion = Some(assertion.into());
        self
    }
}

// =============================================================================
// Node Context
// =============================================================================

/// The per-step view of a flow presented to an executor.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub flow_id: String,
    pub flow_type: FlowType,
    pub app_id: String,
    pub node_id: String,
    /// Executor configuration properties from the graph definition.
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Inputs the engine resolved for this node (input binding already ran).
    pub inputs: HashMap<String, String>,
    /// Read-only snapshot of the flow's runtime data.
    pub runtime_data: HashMap<String, String>,
    pub authenticated_user: Option<AuthenticatedUser>,
    pub trace_id: String,
}

impl NodeContext {
    pub fn input(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).map(String::as_str)
    }

    pub fn runtime(&self, name: &str) -> Option<&str> {
        self.runtime_data.get(name).map(String::as_str)
    }

    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(|v| v.as_str())
    }

    pub fn property_u64(&self, name: &str) -> Option<u64> {
        self.properties.get(name).and_then(|v| v.as_u64())
    }
}

// =============================================================================
// Executor Trait & Registry
// =============================================================================

/// A unit implementing one flow step.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Registry name referenced by graph definitions.
    fn name(&self) -> &'static str;

    /// Inputs this executor needs in addition to the node's declared
    /// input-data spec. The engine binds these before invocation.
    fn default_inputs(&self) -> &'static [&'static str] {
        &[]
    }

    async fn execute(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse>;
}

/// Name-keyed executor set built at startup.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn get(&self, name: &str) -> ServiceResult<Arc<dyn Executor>> {
        self.executors.get(name).cloned().ok_or_else(|| {
            ServiceError::server("FLW-1010", format!("no executor registered as '{}'", name))
        })
    }

    /// Registered names, used to validate graph definitions.
    pub fn names(&self) -> std::collections::HashSet<String> {
        self.executors.keys().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
