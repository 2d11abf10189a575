//! # Flow Repository
//!
//! Persistence for flow contexts (runtime datasource) and flow-graph
//! definitions (identity datasource).
//!
//! The context store implements the engine's [`FlowContextStore`] interface
//! with an optimistic version column: `persist` bumps the in-memory version
//! and compare-and-swaps against the stored one, so a concurrent step from
//! another instance surfaces as a `conflict` error instead of a lost write.

use async_trait::async_trait;
use shared::database::{Dialect, Query};
use shared::errors::{ServiceError, ServiceResult};
use shared::transaction::TransactionManager;

use crate::domain::FlowDefinitionRecord;
use crate::flow::context::FlowContext;
use crate::flow::engine::FlowContextStore;

// =============================================================================
// Flow Contexts
// =============================================================================

const INSERT_CONTEXT: Query = Query::new(
    "flow_context.insert",
    r#"
    INSERT INTO flow_contexts (flow_id, status, context, version)
    VALUES ($1, $2, $3, $4)
    "#,
);

const SELECT_CONTEXT: Query = Query::new(
    "flow_context.select",
    "SELECT context FROM flow_contexts WHERE flow_id = $1",
);

const UPDATE_CONTEXT: Query = Query::new(
    "flow_context.update",
    r#"
    UPDATE flow_contexts
    SET status = $2, context = $3, version = $4, updated_at = NOW()
    WHERE flow_id = $1 AND version = $5
    "#,
);

const DELETE_CONTEXT: Query = Query::new(
    "flow_context.delete",
    "DELETE FROM flow_contexts WHERE flow_id = $1",
);

const DELETE_STALE_CONTEXTS: Query = Query::new(
    "flow_context.delete_stale",
    "DELETE FROM flow_contexts WHERE updated_at < $1",
);

#[derive(sqlx::FromRow)]
struct ContextRow {
    context: serde_json::Value,
}

/// SQL-backed flow-context store.
pub struct SqlFlowContextStore {
    tm: TransactionManager,
    dialect: Dialect,
}

impl SqlFlowContextStore {
    pub fn new(tm: TransactionManager, dialect: Dialect) -> Self {
        Self { tm, dialect }
    }

    /// Garbage collection: drops contexts idle since before `cutoff`
    /// (terminal and abandoned alike). Returns the number removed.
    pub async fn delete_stale(&self, cutoff: chrono::DateTime<chrono::Utc>) -> ServiceResult<u64> {
        let mut session = self.tm.session();
        let result = session
            .execute(sqlx::query(DELETE_STALE_CONTEXTS.sql_for(self.dialect)).bind(cutoff))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl FlowContextStore for SqlFlowContextStore {
    async fn create(&self, ctx: &FlowContext) -> ServiceResult<()> {
        let mut session = self.tm.session();
        let document = serde_json::to_value(ctx)?;
        session
            .execute(
                sqlx::query(INSERT_CONTEXT.sql_for(self.dialect))
                    .bind(&ctx.flow_id)
                    .bind(status_str(ctx))
                    .bind(&document)
                    .bind(ctx.version),
            )
            .await?;
        Ok(())
    }

    async fn load(&self, flow_id: &str) -> ServiceResult<Option<FlowContext>> {
        let mut session = self.tm.session();
        let row: Option<ContextRow> = session
            .fetch_optional(
                sqlx::query_as::<_, ContextRow>(SELECT_CONTEXT.sql_for(self.dialect))
                    .bind(flow_id),
            )
            .await?;
        match row {
            Some(row) => Ok(Some(serde_json::from_value(row.context)?)),
            None => Ok(None),
        }
    }

    async fn persist(&self, ctx: &mut FlowContext) -> ServiceResult<()> {
        let expected = ctx.version;
        ctx.version += 1;
        let document = serde_json::to_value(&*ctx)?;

        let mut session = self.tm.session();
        let result = session
            .execute(
                sqlx::query(UPDATE_CONTEXT.sql_for(self.dialect))
                    .bind(&ctx.flow_id)
                    .bind(status_str(ctx))
                    .bind(&document)
                    .bind(ctx.version)
                    .bind(expected),
            )
            .await?;

        if result.rows_affected() == 0 {
            ctx.version = expected;
            return Err(ServiceError::conflict(
                "FLW-1007",
                "flow context was modified by another step",
            ));
        }
        Ok(())
    }

    async fn delete(&self, flow_id: &str) -> ServiceResult<()> {
        let mut session = self.tm.session();
        session
            .execute(sqlx::query(DELETE_CONTEXT.sql_for(self.dialect)).bind(flow_id))
            .await?;
        Ok(())
    }
}

fn status_str(ctx: &FlowContext) -> String {
    format!("{:?}", ctx.status).to_uppercase()
}

// =============================================================================
// Flow Definitions
// =============================================================================

const UPSERT_DEFINITION: Query = Query::new(
    "flow_definition.upsert",
    r#"
    INSERT INTO flow_definitions (id, flow_type, definition)
    VALUES ($1, $2, $3)
    ON CONFLICT (id) DO UPDATE
    SET flow_type = EXCLUDED.flow_type,
        definition = EXCLUDED.definition,
        updated_at = NOW()
    RETURNING *
    "#,
);

const SELECT_DEFINITION: Query = Query::new(
    "flow_definition.select",
    "SELECT * FROM flow_definitions WHERE id = $1",
);

const SELECT_ALL_DEFINITIONS: Query = Query::new(
    "flow_definition.select_all",
    "SELECT * FROM flow_definitions ORDER BY id",
);

const DELETE_DEFINITION: Query = Query::new(
    "flow_definition.delete",
    "DELETE FROM flow_definitions WHERE id = $1",
);

#[derive(Debug, Clone)]
pub struct FlowDefinitionRepository {
    dialect: Dialect,
}

impl FlowDefinitionRepository {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub async fn upsert(
        &self,
        session: &mut shared::transaction::DbSession,
        id: &str,
        flow_type: &str,
        definition: &serde_json::Value,
    ) -> ServiceResult<FlowDefinitionRecord> {
        Ok(session
            .fetch_one(
                sqlx::query_as::<_, FlowDefinitionRecord>(UPSERT_DEFINITION.sql_for(self.dialect))
                    .bind(id)
                    .bind(flow_type)
                    .bind(definition),
            )
            .await?)
    }

    pub async fn get(
        &self,
        session: &mut shared::transaction::DbSession,
        id: &str,
    ) -> ServiceResult<Option<FlowDefinitionRecord>> {
        Ok(session
            .fetch_optional(
                sqlx::query_as::<_, FlowDefinitionRecord>(SELECT_DEFINITION.sql_for(self.dialect))
                    .bind(id),
            )
            .await?)
    }

    pub async fn list(
        &self,
        session: &mut shared::transaction::DbSession,
    ) -> ServiceResult<Vec<FlowDefinitionRecord>> {
        Ok(session
            .fetch_all(sqlx::query_as::<_, FlowDefinitionRecord>(
                SELECT_ALL_DEFINITIONS.sql_for(self.dialect),
            ))
            .await?)
    }

    pub async fn delete(
        &self,
        session: &mut shared::transaction::DbSession,
        id: &str,
    ) -> ServiceResult<bool> {
        let result = session
            .execute(sqlx::query(DELETE_DEFINITION.sql_for(self.dialect)).bind(id))
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
