//! # Flow Engine
//!
//! Resumable traversal of a flow graph: pick node → bind inputs → run
//! executor → record the attempt → advance → persist → respond.
//!
//! ## Step protocol
//!
//! A request either initiates a flow (`application_id` + `flow_type`) or
//! continues one (`flow_id` + optional `action_id` + inputs). Each step
//! loads the context, acquires exclusive access, walks nodes until the flow
//! needs the client again (input, redirect, retry) or terminates, persists
//! the context, and answers.
//!
//! ## Executor → node status mapping (normative)
//!
//! | Executor status        | Node status  | Step response |
//! |------------------------|--------------|---------------|
//! | `COMPLETE`             | `COMPLETE`   | (advance)     |
//! | `USER_INPUT_REQUIRED`  | `INCOMPLETE` | `VIEW`        |
//! | `EXTERNAL_REDIRECTION` | `INCOMPLETE` | `REDIRECTION` |
//! | `RETRY`                | `INCOMPLETE` | `RETRY`       |
//! | `FAILURE`              | `FAILURE`    | (terminal)    |
//!
//! ## Exclusivity
//!
//! A per-`flow_id` async mutex serializes steps in-process; concurrent
//! continuations wait their turn and observe the resulting state. The store
//! additionally compare-and-swaps a version column on persist, so a second
//! server instance sharing the database surfaces a `conflict` error instead
//! of clobbering a step. `EXECUTING` is an in-memory state held under the
//! lock; it is never persisted, so an aborted step leaves the flow at its
//! last committed checkpoint.
//!
//! ## Failure semantics
//!
//! A client-kind error from an executor terminates the flow as `FAILURE`
//! with the error description as the user-visible reason. A server-kind
//! error aborts the step without persisting, leaving the prior state for a
//! retry. Duplicate continuations after a terminal transition replay the
//! same terminal response until the context is garbage-collected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use shared::errors::{ErrorKind, ServiceError, ServiceResult};
use shared::observability::{Event, EventBus, EventStatus};
use tracing::{debug, info};

use super::context::{FlowContext, FlowStatus, FlowType, NodeAttempt};
use super::executors::{ExecutorRegistry, ExecutorStatus, NodeContext};
use super::graph::{FlowGraph, NodeDefinition, NodeType};

// =============================================================================
// Collaborator Interfaces
// =============================================================================

/// Persistence for flow contexts. `persist` bumps the version and fails with
/// a conflict-kind error when the stored version moved underneath us.
#[async_trait]
pub trait FlowContextStore: Send + Sync {
    async fn create(&self, ctx: &FlowContext) -> ServiceResult<()>;
    async fn load(&self, flow_id: &str) -> ServiceResult<Option<FlowContext>>;
    async fn persist(&self, ctx: &mut FlowContext) -> ServiceResult<()>;
    async fn delete(&self, flow_id: &str) -> ServiceResult<()>;
}

/// Graph resolution for the engine.
#[async_trait]
pub trait GraphProvider: Send + Sync {
    /// The validated graph with the given handle.
    async fn graph(&self, graph_id: &str) -> ServiceResult<Arc<FlowGraph>>;

    /// The graph an application uses for `flow_type`.
    async fn graph_for_app(
        &self,
        app_id: &str,
        flow_type: FlowType,
    ) -> ServiceResult<Arc<FlowGraph>>;
}

/// Mints the assertion a completed flow hands back to the client.
pub trait AssertionIssuer: Send + Sync {
    fn issue(&self, app_id: &str, flow_id: &str, user_id: &str) -> ServiceResult<String>;
}

// =============================================================================
// Step Request / Response
// =============================================================================

/// One client step: initiation or continuation.
#[derive(Debug, Clone, Default)]
pub struct FlowStepRequest {
    pub application_id: Option<String>,
    pub flow_type: Option<FlowType>,
    pub flow_id: Option<String>,
    pub action_id: Option<String>,
    pub inputs: HashMap<String, String>,
    pub trace_id: String,
}

/// How the client should proceed after an incomplete step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    View,
    Redirection,
    Retry,
}

/// The engine's answer to one step.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStepResponse {
    pub flow_id: String,
    pub flow_status: FlowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_data: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub additional_data: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assertion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl FlowStepResponse {
    fn terminal(ctx: &FlowContext) -> Self {
        Self {
            flow_id: ctx.flow_id.clone(),
            flow_status: ctx.status,
            step_type: None,
            required_data: Vec::new(),
            additional_data: HashMap::new(),
            redirect_url: None,
            assertion: ctx.assertion.clone(),
            failure_reason: ctx.failure_reason.clone(),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct FlowEngine {
    graphs: Arc<dyn GraphProvider>,
    executors: Arc<ExecutorRegistry>,
    store: Arc<dyn FlowContextStore>,
    issuer: Arc<dyn AssertionIssuer>,
    bus: EventBus,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FlowEngine {
    pub fn new(
        graphs: Arc<dyn GraphProvider>,
        executors: Arc<ExecutorRegistry>,
        store: Arc<dyn FlowContextStore>,
        issuer: Arc<dyn AssertionIssuer>,
        bus: EventBus,
    ) -> Self {
        Self { graphs, executors, store, issuer, bus, locks: Mutex::new(HashMap::new()) }
    }

    /// Executes one step of a flow.
    pub async fn execute(&self, request: FlowStepRequest) -> ServiceResult<FlowStepResponse> {
        match request.flow_id.clone() {
            Some(flow_id) => self.continue_flow(flow_id, request).await,
            None => self.initiate(request).await,
        }
    }

    async fn initiate(&self, request: FlowStepRequest) -> ServiceResult<FlowStepResponse> {
        let app_id = request.application_id.clone().ok_or_else(|| {
            ServiceError::invalid_request("application_id is required to initiate a flow")
        })?;
        let flow_type = request.flow_type.unwrap_or(FlowType::Authentication);
        let graph = self.graphs.graph_for_app(&app_id, flow_type).await?;

        let mut ctx = FlowContext::new(flow_type, &app_id, &graph.id, graph.start_node());
        ctx.absorb_inputs(request.inputs.clone());
        self.store.create(&ctx).await?;

        info!(flow_id = %ctx.flow_id, app_id = %app_id, flow_type = flow_type.as_str(), "flow initiated");
        self.emit(&request.trace_id, "flow.started", EventStatus::InProgress, &ctx);

        let lock = self.lock_for(&ctx.flow_id);
        let _guard = lock.lock().await;
        self.run(ctx, graph, request).await
    }

    async fn continue_flow(
        &self,
        flow_id: String,
        request: FlowStepRequest,
    ) -> ServiceResult<FlowStepResponse> {
        let lock = self.lock_for(&flow_id);
        let _guard = lock.lock().await;

        let mut ctx = self
            .store
            .load(&flow_id)
            .await?
            .ok_or_else(|| ServiceError::client("FLW-1006", "unknown or expired flow"))?;

        // Replay determinism: a continuation after a terminal transition
        // returns the same terminal response until garbage collection.
        if ctx.status.is_terminal() {
            debug!(flow_id = %flow_id, "replaying terminal flow response");
            let response = FlowStepResponse::terminal(&ctx);
            drop(_guard);
            self.drop_lock(&flow_id);
            return Ok(response);
        }

        ctx.absorb_inputs(request.inputs.clone());
        let graph = self.graphs.graph(&ctx.graph_id).await?;
        self.run(ctx, graph, request).await
    }

    /// Walks nodes until the flow needs the client again or terminates.
    async fn run(
        &self,
        mut ctx: FlowContext,
        graph: Arc<FlowGraph>,
        request: FlowStepRequest,
    ) -> ServiceResult<FlowStepResponse> {
        let trace_id = request.trace_id.clone();
        let mut action_id = request.action_id.clone();
        ctx.status = FlowStatus::Executing;

        loop {
            let Some(node_id) = ctx.current_node.clone() else {
                return self.finalize(ctx, &trace_id).await;
            };
            let node = graph.node(&node_id)?.clone();

            match node.node_type {
                NodeType::Start => {
                    self.advance(&mut ctx, &graph, &node, &mut action_id)?;
                }
                NodeType::End => {
                    return self.finalize(ctx, &trace_id).await;
                }
                NodeType::Prompt => {
                    let missing = self.missing_inputs(&ctx, &node, None);
                    if !missing.is_empty() {
                        return self.suspend(ctx, StepType::View, missing, HashMap::new(), None).await;
                    }
                    self.advance(&mut ctx, &graph, &node, &mut action_id)?;
                }
                NodeType::TaskExecution | NodeType::AuthSuccess => {
                    let Some(executor_config) = node.executor.clone() else {
                        // An AUTH_SUCCESS node without an executor is a plain
                        // terminal marker; END handling decides the outcome.
                        if node.node_type == NodeType::AuthSuccess {
                            self.advance(&mut ctx, &graph, &node, &mut action_id)?;
                            continue;
                        }
                        return Err(ServiceError::server(
                            "FLW-1011",
                            format!("node '{}' has no executor configuration", node.id),
                        ));
                    };

                    let executor = self.executors.get(&executor_config.name)?;
                    let missing = self.missing_inputs(&ctx, &node, Some(executor.default_inputs()));
                    if !missing.is_empty() {
                        // Missing inputs go back to the client without
                        // invoking the executor.
                        return self.suspend(ctx, StepType::View, missing, HashMap::new(), None).await;
                    }

                    let node_ctx = self.node_context(&ctx, &node, &executor_config, &trace_id);
                    let record = ctx.history_record(&node.id, node.node_type.as_str(), &executor_config.name);
                    ctx.execution_history[record].attempts.push(NodeAttempt::begin());
                    let attempt = ctx.execution_history[record].attempts.len() - 1;

                    let outcome = executor.execute(&node_ctx).await;

                    let response = match outcome {
                        Ok(response) => response,
                        Err(e) if e.kind == ErrorKind::Client => {
                            // Client-kind errors become a user-visible flow
                            // failure.
                            ctx.execution_history[record].attempts[attempt].finish("FAILURE");
                            return self.fail(ctx, e.description, &trace_id).await;
                        }
                        Err(e) => {
                            // Server-kind errors abort the step; the flow
                            // stays at its last persisted checkpoint.
                            ctx.execution_history[record].attempts[attempt].finish("ERROR");
                            return Err(e);
                        }
                    };

                    let node_status = match response.status() {
                        ExecutorStatus::Complete => "COMPLETE",
                        ExecutorStatus::Failure => "FAILURE",
                        _ => "INCOMPLETE",
                    };
                    ctx.execution_history[record].attempts[attempt].finish(node_status);
                    self.emit(&trace_id, "flow.node.executed", EventStatus::Success, &ctx);

                    // Merge the executor's context mutations.
                    ctx.runtime_data.extend(response.runtime_data.clone());
                    if let Some(user) = response.authenticated_user.clone() {
                        ctx.authenticated_user = Some(user);
                    }
                    if let Some(assertion) = response.assertion.clone() {
                        ctx.assertion = Some(assertion);
                    }

                    match response.status() {
                        ExecutorStatus::Complete => {
                            self.advance(&mut ctx, &graph, &node, &mut action_id)?;
                        }
                        ExecutorStatus::UserInputRequired => {
                            return self
                                .suspend(
                                    ctx,
                                    StepType::View,
                                    response.required_data,
                                    response.additional_data,
                                    None,
                                )
                                .await;
                        }
                        ExecutorStatus::ExternalRedirection => {
                            return self
                                .suspend(
                                    ctx,
                                    StepType::Redirection,
                                    response.required_data,
                                    response.additional_data,
                                    response.redirect_url,
                                )
                                .await;
                        }
                        ExecutorStatus::Retry => {
                            if let Some(limit) = node.retry_limit() {
                                let attempts = ctx.execution_history[record].attempts.len() as u64;
                                if attempts >= limit {
                                    return self
                                        .fail(ctx, "retry limit exceeded".to_string(), &trace_id)
                                        .await;
                                }
                            }
                            let reason = response
                                .failure_reason
                                .clone()
                                .unwrap_or_else(|| "retry required".to_string());
                            let mut additional = response.additional_data;
                            additional.insert("retry_reason".to_string(), reason);
                            return self
                                .suspend(ctx, StepType::Retry, response.required_data, additional, None)
                                .await;
                        }
                        ExecutorStatus::Failure => {
                            let reason = response
                                .failure_reason
                                .unwrap_or_else(|| "flow step failed".to_string());
                            return self.fail(ctx, reason, &trace_id).await;
                        }
                    }
                }
            }
        }
    }

    /// Input binding: each required input is sourced from `user_input_data`,
    /// then `runtime_data`, then the authenticated user's attributes.
    fn missing_inputs(
        &self,
        ctx: &FlowContext,
        node: &NodeDefinition,
        executor_defaults: Option<&[&str]>,
    ) -> Vec<String> {
        let mut missing = Vec::new();
        for spec in &node.input_data {
            if spec.required && ctx.resolve_input(&spec.name).is_none() {
                missing.push(spec.name.clone());
            }
        }
        for name in executor_defaults.unwrap_or(&[]) {
            if !node.input_data.iter().any(|s| s.name == *name)
                && ctx.resolve_input(name).is_none()
            {
                missing.push((*name).to_string());
            }
        }
        missing
    }

    fn node_context(
        &self,
        ctx: &FlowContext,
        node: &NodeDefinition,
        executor: &super::graph::ExecutorConfig,
        trace_id: &str,
    ) -> NodeContext {
        let mut inputs = HashMap::new();
        for spec in &node.input_data {
            if let Some(value) = ctx.resolve_input(&spec.name) {
                inputs.insert(spec.name.clone(), value.to_string());
            }
        }
        if let Ok(registered) = self.executors.get(&executor.name) {
            for name in registered.default_inputs() {
                if let Some(value) = ctx.resolve_input(name) {
                    inputs.insert((*name).to_string(), value.to_string());
                }
            }
        }
        NodeContext {
            flow_id: ctx.flow_id.clone(),
            flow_type: ctx.flow_type,
            app_id: ctx.app_id.clone(),
            node_id: node.id.clone(),
            properties: executor.properties.clone(),
            inputs,
            runtime_data: ctx.runtime_data.clone(),
            authenticated_user: ctx.authenticated_user.clone(),
            trace_id: trace_id.to_string(),
        }
    }

    fn advance(
        &self,
        ctx: &mut FlowContext,
        graph: &FlowGraph,
        node: &NodeDefinition,
        action_id: &mut Option<String>,
    ) -> ServiceResult<()> {
        let selected = if node.actions.is_empty() {
            graph.next_node(node, None)?
        } else {
            let action = action_id.take();
            graph.next_node(node, action.as_deref())?
        };
        ctx.current_node = selected;
        Ok(())
    }

    /// Persists an incomplete step and answers the client.
    async fn suspend(
        &self,
        mut ctx: FlowContext,
        step_type: StepType,
        required_data: Vec<String>,
        additional_data: HashMap<String, String>,
        redirect_url: Option<String>,
    ) -> ServiceResult<FlowStepResponse> {
        ctx.status = FlowStatus::Prompting;
        self.store.persist(&mut ctx).await?;
        Ok(FlowStepResponse {
            flow_id: ctx.flow_id.clone(),
            flow_status: ctx.status,
            step_type: Some(step_type),
            required_data,
            additional_data,
            redirect_url,
            assertion: None,
            failure_reason: None,
        })
    }

    async fn fail(
        &self,
        mut ctx: FlowContext,
        reason: String,
        trace_id: &str,
    ) -> ServiceResult<FlowStepResponse> {
        ctx.status = FlowStatus::Failure;
        ctx.failure_reason = Some(reason);
        self.store.persist(&mut ctx).await?;
        self.emit(trace_id, "flow.failed", EventStatus::Failure, &ctx);
        self.drop_lock(&ctx.flow_id);
        info!(flow_id = %ctx.flow_id, reason = ctx.failure_reason.as_deref().unwrap_or(""), "flow failed");
        Ok(FlowStepResponse::terminal(&ctx))
    }

    /// Terminal handling for a flow that ran out of nodes.
    async fn finalize(
        &self,
        mut ctx: FlowContext,
        trace_id: &str,
    ) -> ServiceResult<FlowStepResponse> {
        let authenticated = ctx
            .authenticated_user
            .as_ref()
            .map(|u| u.is_authenticated)
            .unwrap_or(false);

        if !authenticated {
            return self
                .fail(ctx, "flow ended without an authenticated user".to_string(), trace_id)
                .await;
        }

        ctx.status = FlowStatus::Complete;
        ctx.current_node = None;
        if ctx.assertion.is_none() {
            let user_id = ctx
                .authenticated_user
                .as_ref()
                .and_then(|u| u.user_id.clone())
                .ok_or_else(|| {
                    ServiceError::server("FLW-1012", "authenticated flow has no user id")
                })?;
            ctx.assertion = Some(self.issuer.issue(&ctx.app_id, &ctx.flow_id, &user_id)?);
        }
        self.store.persist(&mut ctx).await?;
        self.emit(trace_id, "flow.completed", EventStatus::Success, &ctx);
        self.drop_lock(&ctx.flow_id);
        info!(flow_id = %ctx.flow_id, "flow completed");
        Ok(FlowStepResponse::terminal(&ctx))
    }

    fn emit(&self, trace_id: &str, event_type: &str, status: EventStatus, ctx: &FlowContext) {
        self.bus.publish(
            Event::new(event_type, "flow-engine")
                .with_trace_id(trace_id)
                .with_status(status)
                .with_data(serde_json::json!({
                    "flow_id": ctx.flow_id,
                    "flow_type": ctx.flow_type.as_str(),
                    "app_id": ctx.app_id,
                    "node": ctx.current_node,
                })),
        );
    }

    fn lock_for(&self, flow_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("flow lock registry poisoned");
        locks
            .entry(flow_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drops lock-registry entries nobody holds. Called by the periodic
    /// sweeper so abandoned flows do not pin their mutexes forever.
    pub fn prune_locks(&self) {
        let mut locks = self.locks.lock().expect("flow lock registry poisoned");
        locks.retain(|_, entry| Arc::strong_count(entry) > 1);
    }

    fn drop_lock(&self, flow_id: &str) {
        // Remove only when nobody else holds the mutex: the registry entry
        // plus the calling step account for two strong references. Waiters
        // queued on the old mutex keep their clone and simply replay the
        // terminal state once they acquire it.
        let mut locks = self.locks.lock().expect("flow lock registry poisoned");
        if let Some(entry) = locks.get(flow_id) {
            if Arc::strong_count(entry) <= 2 {
                locks.remove(flow_id);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::executors::{Executor, ExecutorResponse};
    use crate::flow::graph::GraphDefinition;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    /// Store keeping contexts in a map, with the same version CAS the SQL
    /// store performs.
    #[derive(Default)]
    struct InMemoryFlowStore {
        contexts: Mutex<HashMap<String, FlowContext>>,
    }

    #[async_trait]
    impl FlowContextStore for InMemoryFlowStore {
        async fn create(&self, ctx: &FlowContext) -> ServiceResult<()> {
            self.contexts
                .lock()
                .unwrap()
                .insert(ctx.flow_id.clone(), ctx.clone());
            Ok(())
        }

        async fn load(&self, flow_id: &str) -> ServiceResult<Option<FlowContext>> {
            Ok(self.contexts.lock().unwrap().get(flow_id).cloned())
        }

        async fn persist(&self, ctx: &mut FlowContext) -> ServiceResult<()> {
            let mut contexts = self.contexts.lock().unwrap();
            let stored = contexts.get(&ctx.flow_id).ok_or_else(|| {
                ServiceError::not_found("FLW-1006", "flow context vanished")
            })?;
            if stored.version != ctx.version {
                return Err(ServiceError::conflict(
                    "FLW-1007",
                    "flow context was modified by another step",
                ));
            }
            ctx.version += 1;
            contexts.insert(ctx.flow_id.clone(), ctx.clone());
            Ok(())
        }

        async fn delete(&self, flow_id: &str) -> ServiceResult<()> {
            self.contexts.lock().unwrap().remove(flow_id);
            Ok(())
        }
    }

    struct StaticGraphs {
        graph: Arc<FlowGraph>,
    }

    #[async_trait]
    impl GraphProvider for StaticGraphs {
        async fn graph(&self, _graph_id: &str) -> ServiceResult<Arc<FlowGraph>> {
            Ok(self.graph.clone())
        }

        async fn graph_for_app(
            &self,
            _app_id: &str,
            _flow_type: FlowType,
        ) -> ServiceResult<Arc<FlowGraph>> {
            Ok(self.graph.clone())
        }
    }

    struct StaticIssuer;

    impl AssertionIssuer for StaticIssuer {
        fn issue(&self, app_id: &str, flow_id: &str, user_id: &str) -> ServiceResult<String> {
            Ok(format!("assertion:{}:{}:{}", app_id, flow_id, user_id))
        }
    }

    /// Password-check stand-in counting its invocations.
    struct StubCredentials {
        invocations: AtomicUsize,
        delay: Option<std::time::Duration>,
    }

    #[async_trait]
    impl Executor for StubCredentials {
        fn name(&self) -> &'static str {
            "credentials"
        }

        fn default_inputs(&self) -> &'static [&'static str] {
            &["username", "password"]
        }

        async fn execute(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.invocations.fetch_add(1, Ordering::AcqRel);
            if ctx.input("password") == Some("hunter2") {
                Ok(ExecutorResponse::complete().with_authenticated_user(
                    crate::flow::context::AuthenticatedUser::authenticated("user-alice"),
                ))
            } else {
                Ok(ExecutorResponse::failure("invalid credentials"))
            }
        }
    }

    /// Executor that always asks for a retry.
    struct AlwaysRetry;

    #[async_trait]
    impl Executor for AlwaysRetry {
        fn name(&self) -> &'static str {
            "always_retry"
        }

        fn default_inputs(&self) -> &'static [&'static str] {
            &["otp"]
        }

        async fn execute(&self, _ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
            Ok(ExecutorResponse::retry("wrong otp"))
        }
    }

    /// Executor failing with a server-kind error.
    struct Exploding;

    #[async_trait]
    impl Executor for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        async fn execute(&self, _ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
            Err(ServiceError::server("TST-1", "backend down"))
        }
    }

    // ------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------

    fn credentials_graph() -> GraphDefinition {
        serde_json::from_value(json!({
            "id": "auth_basic",
            "type": "AUTHENTICATION",
            "nodes": [
                {"id": "start", "type": "START", "next": ["creds"]},
                {"id": "creds", "type": "TASK_EXECUTION",
                 "executor": {"name": "credentials"}, "next": ["done"]},
                {"id": "done", "type": "END"}
            ]
        }))
        .unwrap()
    }

    fn retry_graph() -> GraphDefinition {
        serde_json::from_value(json!({
            "id": "otp_flow",
            "type": "AUTHENTICATION",
            "nodes": [
                {"id": "start", "type": "START", "next": ["otp"]},
                {"id": "otp", "type": "TASK_EXECUTION",
                 "executor": {"name": "always_retry"},
                 "properties": {"retry_limit": 3},
                 "next": ["done"]},
                {"id": "done", "type": "END"}
            ]
        }))
        .unwrap()
    }

    fn exploding_graph() -> GraphDefinition {
        serde_json::from_value(json!({
            "id": "exploding_flow",
            "type": "AUTHENTICATION",
            "nodes": [
                {"id": "start", "type": "START", "next": ["boom"]},
                {"id": "boom", "type": "TASK_EXECUTION",
                 "executor": {"name": "exploding"}, "next": ["done"]},
                {"id": "done", "type": "END"}
            ]
        }))
        .unwrap()
    }

    struct Harness {
        engine: Arc<FlowEngine>,
        store: Arc<InMemoryFlowStore>,
        credentials: Arc<StubCredentials>,
    }

    fn harness(definition: GraphDefinition, delay: Option<std::time::Duration>) -> Harness {
        let credentials = Arc::new(StubCredentials { invocations: AtomicUsize::new(0), delay });
        let mut registry = ExecutorRegistry::new();
        registry.register(credentials.clone());
        registry.register(Arc::new(AlwaysRetry));
        registry.register(Arc::new(Exploding));

        let graph = Arc::new(FlowGraph::from_definition(definition, &registry.names()).unwrap());
        let store = Arc::new(InMemoryFlowStore::default());
        let engine = Arc::new(FlowEngine::new(
            Arc::new(StaticGraphs { graph }),
            Arc::new(registry),
            store.clone(),
            Arc::new(StaticIssuer),
            EventBus::new(),
        ));
        Harness { engine, store, credentials }
    }

    fn initiation() -> FlowStepRequest {
        FlowStepRequest {
            application_id: Some("app-1".into()),
            flow_type: Some(FlowType::Authentication),
            trace_id: "trace-1".into(),
            ..Default::default()
        }
    }

    fn continuation(flow_id: &str, inputs: &[(&str, &str)]) -> FlowStepRequest {
        FlowStepRequest {
            flow_id: Some(flow_id.to_string()),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            trace_id: "trace-1".into(),
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn missing_inputs_suspend_without_invoking_the_executor() {
        let h = harness(credentials_graph(), None);
        let response = h.engine.execute(initiation()).await.unwrap();

        assert_eq!(response.flow_status, FlowStatus::Prompting);
        assert_eq!(response.step_type, Some(StepType::View));
        let mut required = response.required_data.clone();
        required.sort();
        assert_eq!(required, vec!["password", "username"]);
        assert_eq!(h.credentials.invocations.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn valid_credentials_complete_the_flow_with_an_assertion() {
        let h = harness(credentials_graph(), None);
        let first = h.engine.execute(initiation()).await.unwrap();
        let response = h
            .engine
            .execute(continuation(&first.flow_id, &[("username", "alice"), ("password", "hunter2")]))
            .await
            .unwrap();

        assert_eq!(response.flow_status, FlowStatus::Complete);
        let assertion = response.assertion.expect("assertion present");
        assert!(assertion.contains("user-alice"));
        assert!(assertion.contains(&first.flow_id));
    }

    #[tokio::test]
    async fn executor_failure_terminates_with_reason() {
        let h = harness(credentials_graph(), None);
        let first = h.engine.execute(initiation()).await.unwrap();
        let response = h
            .engine
            .execute(continuation(&first.flow_id, &[("username", "alice"), ("password", "wrong")]))
            .await
            .unwrap();

        assert_eq!(response.flow_status, FlowStatus::Failure);
        assert_eq!(response.failure_reason.as_deref(), Some("invalid credentials"));
    }

    #[tokio::test]
    async fn terminal_responses_replay_deterministically() {
        let h = harness(credentials_graph(), None);
        let first = h.engine.execute(initiation()).await.unwrap();
        let inputs = [("username", "alice"), ("password", "hunter2")];
        let done = h
            .engine
            .execute(continuation(&first.flow_id, &inputs))
            .await
            .unwrap();

        for _ in 0..3 {
            let replay = h
                .engine
                .execute(continuation(&first.flow_id, &inputs))
                .await
                .unwrap();
            assert_eq!(replay.flow_status, FlowStatus::Complete);
            assert_eq!(replay.assertion, done.assertion);
        }
        // The executor ran exactly once despite the replays.
        assert_eq!(h.credentials.invocations.load(Ordering::Acquire), 1);

        // After garbage collection the flow is gone.
        h.store.delete(&first.flow_id).await.unwrap();
        let err = h
            .engine
            .execute(continuation(&first.flow_id, &inputs))
            .await
            .unwrap_err();
        assert_eq!(err.code, "FLW-1006");
    }

    #[tokio::test]
    async fn parallel_continuations_serialize_to_one_executor_run() {
        let h = harness(
            credentials_graph(),
            Some(std::time::Duration::from_millis(50)),
        );
        let first = h.engine.execute(initiation()).await.unwrap();
        let flow_id = first.flow_id.clone();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let engine = h.engine.clone();
            let flow_id = flow_id.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .execute(continuation(
                        &flow_id,
                        &[("username", "alice"), ("password", "hunter2")],
                    ))
                    .await
            }));
        }

        let mut assertions = Vec::new();
        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.flow_status, FlowStatus::Complete);
            assertions.push(response.assertion.unwrap());
        }

        // Exactly one step executed; the rest observed its terminal state.
        assert_eq!(h.credentials.invocations.load(Ordering::Acquire), 1);
        assertions.dedup();
        assert_eq!(assertions.len(), 1);
    }

    #[tokio::test]
    async fn retry_responses_stay_on_the_node_until_the_limit() {
        let h = harness(retry_graph(), None);
        let first = h.engine.execute(initiation()).await.unwrap();
        assert_eq!(first.step_type, Some(StepType::View));

        // Two retries allowed, the third attempt trips the limit.
        for _ in 0..2 {
            let response = h
                .engine
                .execute(continuation(&first.flow_id, &[("otp", "000000")]))
                .await
                .unwrap();
            assert_eq!(response.step_type, Some(StepType::Retry));
            assert_eq!(response.flow_status, FlowStatus::Prompting);
        }

        let response = h
            .engine
            .execute(continuation(&first.flow_id, &[("otp", "000000")]))
            .await
            .unwrap();
        assert_eq!(response.flow_status, FlowStatus::Failure);
        assert_eq!(response.failure_reason.as_deref(), Some("retry limit exceeded"));
    }

    #[tokio::test]
    async fn server_errors_abort_without_mutating_persisted_state() {
        let h = harness(exploding_graph(), None);
        let request = FlowStepRequest {
            application_id: Some("app-1".into()),
            flow_type: Some(FlowType::Authentication),
            trace_id: "trace-1".into(),
            ..Default::default()
        };
        let err = h.engine.execute(request).await.unwrap_err();
        assert!(err.is_server_error());

        // The persisted context still sits at the initiated checkpoint, so
        // the client can retry the step.
        let contexts = h.store.contexts.lock().unwrap();
        let ctx = contexts.values().next().expect("context persisted at creation");
        assert!(!ctx.status.is_terminal());
    }

    #[tokio::test]
    async fn history_records_attempts_in_order() {
        let h = harness(credentials_graph(), None);
        let first = h.engine.execute(initiation()).await.unwrap();
        h.engine
            .execute(continuation(&first.flow_id, &[("username", "alice"), ("password", "hunter2")]))
            .await
            .unwrap();

        let contexts = h.store.contexts.lock().unwrap();
        let ctx = contexts.get(&first.flow_id).unwrap();
        assert_eq!(ctx.execution_history.len(), 1);
        let record = &ctx.execution_history[0];
        assert_eq!(record.node_id, "creds");
        assert_eq!(record.executor, "credentials");
        assert_eq!(record.attempts.len(), 1);
        assert_eq!(record.attempts[0].status, "COMPLETE");
        assert!(record.attempts[0].start_time > 0);
        assert!(record.attempts[0].end_time >= record.attempts[0].start_time);
    }
}
