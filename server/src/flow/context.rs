//! # Flow Runtime State
//!
//! The per-flow context persisted between HTTP round-trips, the execution
//! history appended by the engine, and the authenticated-user projection
//! carried through executors.
//!
//! A context is exclusively owned by one step at a time (enforced by the
//! engine's lock registry) and carries an optimistic `version` that the
//! store compare-and-swaps on persist.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Flow Type & Status
// =============================================================================

/// What a flow graph produces: an authenticated user or a registered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    Authentication,
    Registration,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "AUTHENTICATION",
            Self::Registration => "REGISTRATION",
        }
    }
}

/// Lifecycle state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    /// Flow id allocated, start node resolved.
    Initiated,
    /// Awaiting client input or an external redirect round-trip.
    Prompting,
    /// Inside an executor. At most one step per flow may hold this state.
    Executing,
    /// Terminal success; assertion available.
    Complete,
    /// Terminal failure with reason.
    Failure,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failure)
    }
}

// =============================================================================
// Authenticated User
// =============================================================================

/// The user identity accumulated by a flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub is_authenticated: bool,
    pub user_id: Option<String>,
    /// Claims/attributes gathered along the way (federated claims, collected
    /// attributes). Values are strings; richer values are JSON-encoded.
    pub attributes: HashMap<String, String>,
}

impl AuthenticatedUser {
    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self { is_authenticated: true, user_id: Some(user_id.into()), attributes: HashMap::new() }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Execution History
// =============================================================================

/// One executor invocation. Timestamps are Unix milliseconds; zero means
/// "not recorded".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeAttempt {
    pub start_time: i64,
    pub end_time: i64,
    pub status: String,
}

impl NodeAttempt {
    /// Starts an attempt now.
    pub fn begin() -> Self {
        Self { start_time: Utc::now().timestamp_millis(), end_time: 0, status: String::new() }
    }

    /// Closes the attempt with a status.
    pub fn finish(&mut self, status: impl Into<String>) {
        self.end_time = Utc::now().timestamp_millis();
        self.status = status.into();
    }

    /// Attempt duration in **microseconds**: `(end - start) * 1000` for the
    /// millisecond-resolution timestamps, zero when either endpoint is zero.
    pub fn duration(&self) -> i64 {
        if self.start_time == 0 || self.end_time == 0 {
            return 0;
        }
        (self.end_time - self.start_time) * 1000
    }
}

/// Per-node record in the execution history. Immutable once appended except
/// for accumulating attempts on retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_id: String,
    pub node_type: String,
    pub executor: String,
    pub attempts: Vec<NodeAttempt>,
}

impl NodeExecutionRecord {
    pub fn new(
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        executor: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            executor: executor.into(),
            attempts: Vec::new(),
        }
    }

    /// Cumulative duration over all attempts, in microseconds.
    pub fn total_duration(&self) -> i64 {
        self.attempts.iter().map(NodeAttempt::duration).sum()
    }
}

// =============================================================================
// Flow Context
// =============================================================================

/// The persisted runtime state of one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowContext {
    pub flow_id: String,
    pub flow_type: FlowType,
    pub app_id: String,
    /// The graph this flow executes; pinned at initiation.
    pub graph_id: String,
    pub current_node: Option<String>,
    pub status: FlowStatus,
    /// Inputs supplied by the client across steps.
    pub user_input_data: HashMap<String, String>,
    /// Values produced by executors for downstream nodes.
    pub runtime_data: HashMap<String, String>,
    pub authenticated_user: Option<AuthenticatedUser>,
    pub execution_history: Vec<NodeExecutionRecord>,
    /// Assertion minted on terminal success.
    pub assertion: Option<String>,
    pub failure_reason: Option<String>,
    /// Optimistic concurrency stamp, bumped by the store on each persist.
    pub version: i64,
}

impl FlowContext {
    /// A fresh context positioned at `start_node`.
    pub fn new(
        flow_type: FlowType,
        app_id: impl Into<String>,
        graph_id: impl Into<String>,
        start_node: impl Into<String>,
    ) -> Self {
        Self {
            flow_id: Uuid::new_v4().to_string(),
            flow_type,
            app_id: app_id.into(),
            graph_id: graph_id.into(),
            current_node: Some(start_node.into()),
            status: FlowStatus::Initiated,
            user_input_data: HashMap::new(),
            runtime_data: HashMap::new(),
            authenticated_user: None,
            execution_history: Vec::new(),
            assertion: None,
            failure_reason: None,
            version: 0,
        }
    }

    /// Merges a step's client inputs into the accumulated input data.
    pub fn absorb_inputs(&mut self, inputs: HashMap<String, String>) {
        self.user_input_data.extend(inputs);
    }

    /// Finds or appends the history record for `node_id`, returning its
    /// index. Retries of the same node accumulate attempts on one record.
    pub fn history_record(
        &mut self,
        node_id: &str,
        node_type: &str,
        executor: &str,
    ) -> usize {
        if let Some(idx) = self
            .execution_history
            .iter()
            .rposition(|r| r.node_id == node_id)
        {
            return idx;
        }
        self.execution_history
            .push(NodeExecutionRecord::new(node_id, node_type, executor));
        self.execution_history.len() - 1
    }

    /// Resolves one required input, in source priority order:
    /// `user_input_data`, then `runtime_data`, then the authenticated user's
    /// attributes.
    pub fn resolve_input(&self, name: &str) -> Option<&str> {
        if let Some(v) = self.user_input_data.get(name) {
            return Some(v);
        }
        if let Some(v) = self.runtime_data.get(name) {
            return Some(v);
        }
        self.authenticated_user
            .as_ref()
            .and_then(|u| u.attributes.get(name))
            .map(String::as_str)
    }
}

// =============================================================================
// Tests
// =============================================================================
