//! # MCP Admin Tools
//!
//! Management operations exposed as typed tools with JSON-Schema-annotated
//! inputs, for Model Context Protocol clients. Every tool delegates to the
//! same service layer the HTTP handlers use, so service-error handling and
//! validation are never bypassed.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::errors::{ServiceError, ServiceResult};
use uuid::Uuid;

use crate::service::{ApplicationService, ApplicationUpsert, FlowDefinitionService};

// =============================================================================
// Registry
// =============================================================================

type ToolHandler = Box<dyn Fn(Value) -> BoxFuture<'static, ServiceResult<Value>> + Send + Sync>;

/// One registered management operation.
pub struct RegisteredTool {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    handler: ToolHandler,
}

/// Listing entry handed to MCP clients.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// Name-keyed tool set.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.name, tool);
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema.clone(),
            })
            .collect();
        descriptors.sort_by_key(|d| d.name);
        descriptors
    }

    pub async fn call(&self, name: &str, arguments: Value) -> ServiceResult<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ServiceError::not_found("MCP-1001", format!("no tool named '{}'", name)))?;
        (tool.handler)(arguments).await
    }
}

/// Builds a tool around a typed argument struct: the JSON Schema comes from
/// the type, and the handler parses into it before dispatching.
fn tool<A, F>(name: &'static str, description: &'static str, run: F) -> RegisteredTool
where
    A: for<'de> Deserialize<'de> + JsonSchema + Send + 'static,
    F: Fn(A) -> BoxFuture<'static, ServiceResult<Value>> + Send + Sync + 'static,
{
    RegisteredTool {
        name,
        description,
        input_schema: serde_json::to_value(schema_for!(A))
            .unwrap_or_else(|_| json!({"type": "object"})),
        handler: Box::new(move |arguments| {
            let parsed: Result<A, _> = serde_json::from_value(arguments);
            match parsed {
                Ok(args) => run(args),
                Err(e) => {
                    let err = ServiceError::invalid_request(format!("invalid tool arguments: {}", e));
                    Box::pin(async move { Err(err) })
                }
            }
        }),
    }
}

// =============================================================================
// Argument Types
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
struct EmptyArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
struct ApplicationIdArgs {
    /// Application id (UUID).
    id: Uuid,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ApplicationArgs {
    /// Human-readable application name.
    name: String,
    /// OAuth2 client identifier; globally unique.
    client_id: String,
    /// Raw client secret; omit for public clients.
    client_secret: Option<String>,
    #[serde(default)]
    grant_types: Vec<String>,
    /// Allowed token-endpoint auth methods; at least one.
    token_auth_methods: Vec<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
    #[serde(default)]
    scopes: Vec<String>,
    /// Per-scope claim overrides.
    #[serde(default)]
    scope_claims: serde_json::Map<String, Value>,
    #[serde(default)]
    id_token_user_attributes: Vec<String>,
    /// Authentication-flow graph handle.
    auth_flow_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ApplicationUpdateArgs {
    id: Uuid,
    #[serde(flatten)]
    application: ApplicationArgs,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FlowIdArgs {
    /// Flow-graph handle, e.g. `auth_flow_config_basic`.
    id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FlowDefinitionArgs {
    /// The declarative graph document (id, type, nodes).
    definition: Value,
}

impl From<ApplicationArgs> for ApplicationUpsert {
    fn from(args: ApplicationArgs) -> Self {
        Self {
            name: args.name,
            client_id: args.client_id,
            client_secret: args.client_secret,
            grant_types: args.grant_types,
            token_auth_methods: args.token_auth_methods,
            redirect_uris: args.redirect_uris,
            scopes: args.scopes,
            scope_claims: Value::Object(args.scope_claims),
            id_token_user_attributes: args.id_token_user_attributes,
            auth_flow_id: args.auth_flow_id,
        }
    }
}

// =============================================================================
// Toolset
// =============================================================================

/// Builds the full admin toolset: list/get/create/update/delete for
/// applications and flow definitions.
pub fn build_registry(
    applications: Arc<ApplicationService>,
    flows: Arc<FlowDefinitionService<ApplicationService>>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    let apps = applications.clone();
    registry.register(tool(
        "application_list",
        "List all registered OAuth2 applications.",
        move |_: EmptyArgs| {
            let apps = apps.clone();
            Box::pin(async move { Ok(serde_json::to_value(apps.list().await?)?) })
        },
    ));

    let apps = applications.clone();
    registry.register(tool(
        "application_get",
        "Fetch one application by id.",
        move |args: ApplicationIdArgs| {
            let apps = apps.clone();
            Box::pin(async move { Ok(serde_json::to_value(apps.get(args.id).await?)?) })
        },
    ));

    let apps = applications.clone();
    registry.register(tool(
        "application_create",
        "Register a new OAuth2 application.",
        move |args: ApplicationArgs| {
            let apps = apps.clone();
            Box::pin(async move { Ok(serde_json::to_value(apps.create(args.into()).await?)?) })
        },
    ));

    let apps = applications.clone();
    registry.register(tool(
        "application_update",
        "Update an application's configuration.",
        move |args: ApplicationUpdateArgs| {
            let apps = apps.clone();
            Box::pin(async move {
                Ok(serde_json::to_value(
                    apps.update(args.id, args.application.into()).await?,
                )?)
            })
        },
    ));

    let apps = applications;
    registry.register(tool(
        "application_delete",
        "Delete an application.",
        move |args: ApplicationIdArgs| {
            let apps = apps.clone();
            Box::pin(async move {
                apps.delete(args.id).await?;
                Ok(json!({"deleted": args.id}))
            })
        },
    ));

    let defs = flows.clone();
    registry.register(tool(
        "flow_list",
        "List all flow-graph definitions.",
        move |_: EmptyArgs| {
            let defs = defs.clone();
            Box::pin(async move { Ok(serde_json::to_value(defs.list().await?)?) })
        },
    ));

    let defs = flows.clone();
    registry.register(tool(
        "flow_get",
        "Fetch one flow-graph definition by handle.",
        move |args: FlowIdArgs| {
            let defs = defs.clone();
            Box::pin(async move { Ok(serde_json::to_value(defs.get(&args.id).await?)?) })
        },
    ));

    let defs = flows.clone();
    registry.register(tool(
        "flow_create",
        "Register a flow-graph definition (validated before storage).",
        move |args: FlowDefinitionArgs| {
            let defs = defs.clone();
            Box::pin(async move { Ok(serde_json::to_value(defs.upsert(args.definition).await?)?) })
        },
    ));

    let defs = flows.clone();
    registry.register(tool(
        "flow_update",
        "Replace a flow-graph definition (validated before storage).",
        move |args: FlowDefinitionArgs| {
            let defs = defs.clone();
            Box::pin(async move { Ok(serde_json::to_value(defs.upsert(args.definition).await?)?) })
        },
    ));

    let defs = flows;
    registry.register(tool(
        "flow_delete",
        "Delete a flow-graph definition.",
        move |args: FlowIdArgs| {
            let defs = defs.clone();
            Box::pin(async move {
                defs.delete(&args.id).await?;
                Ok(json!({"deleted": args.id}))
            })
        },
    ));

    registry
}

// =============================================================================
// Tests
// =============================================================================
