//! # Flow Definitions
//!
//! Loads, validates, and serves flow-graph definitions. Definitions ship as
//! JSON documents in the configured graph directory and are seeded into the
//! identity datasource at startup; admin tools manage them through the same
//! service. Validated graphs are cached, keyed by graph id.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use shared::cache::TtlCache;
use shared::config::CacheConfig;
use shared::errors::{ServiceError, ServiceResult};
use shared::transaction::TransactionManager;
use tracing::info;

use crate::domain::FlowDefinitionRecord;
use crate::flow::engine::GraphProvider;
use crate::flow::graph::{FlowGraph, GraphDefinition};
use crate::flow::FlowType;
use crate::repository::FlowDefinitionRepository;

use super::client_auth::ApplicationLookup;

/// Graph used by registration flows unless an application overrides it.
const DEFAULT_REGISTRATION_FLOW: &str = "registration_flow_config_basic";

/// Parses and validates one definition document.
pub fn parse_definition(
    document: &serde_json::Value,
    known_executors: &HashSet<String>,
) -> ServiceResult<(GraphDefinition, FlowGraph)> {
    let definition: GraphDefinition = serde_json::from_value(document.clone())
        .map_err(|e| ServiceError::client("FLW-1008", format!("malformed graph definition: {}", e)))?;
    let graph = FlowGraph::from_definition(definition.clone(), known_executors)?;
    Ok((definition, graph))
}

pub struct FlowDefinitionService<L> {
    tm: TransactionManager,
    repo: FlowDefinitionRepository,
    applications: Arc<L>,
    known_executors: HashSet<String>,
    default_authn_flow: String,
    cache: TtlCache<String, Arc<FlowGraph>>,
}

impl<L: ApplicationLookup> FlowDefinitionService<L> {
    pub fn new(
        tm: TransactionManager,
        repo: FlowDefinitionRepository,
        applications: Arc<L>,
        known_executors: HashSet<String>,
        default_authn_flow: String,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            tm,
            repo,
            applications,
            known_executors,
            default_authn_flow,
            cache: TtlCache::from_config(cache_config),
        }
    }

    /// Seeds every `*.json` definition under `directory` into the store.
    /// Invalid documents abort startup; a half-registered graph set is worse
    /// than a refusal to boot.
    pub async fn seed_from_directory(&self, directory: &Path) -> ServiceResult<usize> {
        let entries = std::fs::read_dir(directory).map_err(|e| {
            ServiceError::server(
                "FLW-1009",
                format!("cannot read graph directory {}: {}", directory.display(), e),
            )
        })?;

        let mut seeded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                ServiceError::server("FLW-1009", format!("cannot read {}: {}", path.display(), e))
            })?;
            let document: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                ServiceError::server("FLW-1009", format!("invalid JSON in {}: {}", path.display(), e))
            })?;
            let (definition, _) = parse_definition(&document, &self.known_executors)?;

            let mut session = self.tm.session();
            self.repo
                .upsert(&mut session, &definition.id, definition.flow_type.as_str(), &document)
                .await?;
            seeded += 1;
        }
        info!(directory = %directory.display(), count = seeded, "flow definitions seeded");
        Ok(seeded)
    }

    pub async fn upsert(&self, document: serde_json::Value) -> ServiceResult<FlowDefinitionRecord> {
        let (definition, _) = parse_definition(&document, &self.known_executors)?;
        let mut session = self.tm.session();
        let record = self
            .repo
            .upsert(&mut session, &definition.id, definition.flow_type.as_str(), &document)
            .await?;
        self.cache.invalidate(&definition.id);
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> ServiceResult<FlowDefinitionRecord> {
        let mut session = self.tm.session();
        self.repo
            .get(&mut session, id)
            .await?
            .ok_or_else(|| ServiceError::not_found("FLW-1006", "flow definition does not exist"))
    }

    pub async fn list(&self) -> ServiceResult<Vec<FlowDefinitionRecord>> {
        let mut session = self.tm.session();
        self.repo.list(&mut session).await
    }

    pub async fn delete(&self, id: &str) -> ServiceResult<()> {
        let mut session = self.tm.session();
        if !self.repo.delete(&mut session, id).await? {
            return Err(ServiceError::not_found("FLW-1006", "flow definition does not exist"));
        }
        self.cache.invalidate(&id.to_string());
        Ok(())
    }
}

#[async_trait]
impl<L: ApplicationLookup + 'static> GraphProvider for FlowDefinitionService<L> {
    async fn graph(&self, graph_id: &str) -> ServiceResult<Arc<FlowGraph>> {
        if let Some(graph) = self.cache.get(&graph_id.to_string()) {
            return Ok(graph);
        }
        let record = self.get(graph_id).await?;
        let (_, graph) = parse_definition(&record.definition, &self.known_executors)?;
        let graph = Arc::new(graph);
        self.cache.put(graph_id.to_string(), graph.clone());
        Ok(graph)
    }

    async fn graph_for_app(
        &self,
        app_id: &str,
        flow_type: FlowType,
    ) -> ServiceResult<Arc<FlowGraph>> {
        let app = self
            .applications
            .by_client_id(app_id)
            .await?
            .ok_or_else(|| ServiceError::client("APP-1005", "unknown application"))?;

        let graph_id = match flow_type {
            FlowType::Registration => DEFAULT_REGISTRATION_FLOW.to_string(),
            FlowType::Authentication => app
                .auth_flow_id
                .clone()
                .unwrap_or_else(|| self.default_authn_flow.clone()),
        };

        let graph = self.graph(&graph_id).await?;
        if graph.flow_type != flow_type {
            return Err(ServiceError::server(
                "FLW-1013",
                format!("graph '{}' is not a {} graph", graph_id, flow_type.as_str()),
            ));
        }
        Ok(graph)
    }
}

// =============================================================================
// Tests
// =============================================================================
