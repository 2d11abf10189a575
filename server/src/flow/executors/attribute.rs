//! Attribute-collector executor: prompts until all configured fields are
//! supplied, then forwards them into the flow's runtime data.

use async_trait::async_trait;
use shared::errors::ServiceResult;

use super::{Executor, ExecutorResponse, NodeContext};

pub struct AttributeCollectorExecutor;

impl AttributeCollectorExecutor {
    /// Fields to collect: the node's `attributes` property, falling back to
    /// whatever inputs the node spec declared.
    fn fields(ctx: &NodeContext) -> Vec<String> {
        if let Some(list) = ctx.properties.get("attributes").and_then(|v| v.as_array()) {
            return list
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect();
        }
        ctx.inputs.keys().cloned().collect()
    }
}

#[async_trait]
impl Executor for AttributeCollectorExecutor {
    fn name(&self) -> &'static str {
        "attribute_collector"
    }

    async fn execute(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
        let fields = Self::fields(ctx);
        let missing: Vec<String> = fields
            .iter()
            .filter(|f| ctx.input(f).is_none() && ctx.runtime(f).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Ok(ExecutorResponse::user_input_required(missing));
        }

        let mut response = ExecutorResponse::complete();
        for field in fields {
            if let Some(value) = ctx.input(&field) {
                response.runtime_data.insert(field, value.to_string());
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::context::FlowType;
    use crate::flow::executors::ExecutorStatus;
    use serde_json::json;
    use std::collections::HashMap;

    fn node_ctx(properties: serde_json::Value, inputs: &[(&str, &str)]) -> NodeContext {
        NodeContext {
            flow_id: "flow-1".into(),
            flow_type: FlowType::Registration,
            app_id: "app-1".into(),
            node_id: "collect".into(),
            properties: properties.as_object().cloned().unwrap_or_default(),
            inputs: inputs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            runtime_data: HashMap::new(),
            authenticated_user: None,
            trace_id: "trace-1".into(),
        }
    }

    #[tokio::test]
    async fn prompts_for_all_missing_fields() {
        let ctx = node_ctx(
            json!({"attributes": ["email", "firstName", "lastName"]}),
            &[("email", "a@example.com")],
        );
        let response = AttributeCollectorExecutor.execute(&ctx).await.unwrap();
        assert_eq!(response.status(), ExecutorStatus::UserInputRequired);
        assert_eq!(response.required_data, vec!["firstName".to_string(), "lastName".to_string()]);
    }

    #[tokio::test]
    async fn forwards_collected_fields_into_runtime_data() {
        let ctx = node_ctx(
            json!({"attributes": ["email", "firstName"]}),
            &[("email", "a@example.com"), ("firstName", "Alice")],
        );
        let response = AttributeCollectorExecutor.execute(&ctx).await.unwrap();
        assert_eq!(response.status(), ExecutorStatus::Complete);
        assert_eq!(response.runtime_data["email"], "a@example.com");
        assert_eq!(response.runtime_data["firstName"], "Alice");
    }
}
