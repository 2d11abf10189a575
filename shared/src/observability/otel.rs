//! OpenTelemetry subscriber: maps bus events to OTLP spans.
//!
//! Each event becomes a short span named after the event type, carrying the
//! event fields as attributes. Export runs on the batch processor, so span
//! delivery may be reordered relative to publish order.

use async_trait::async_trait;
use opentelemetry::sdk::trace::Tracer as SdkTracer;
use opentelemetry::trace::{Span, StatusCode, Tracer};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;

use crate::config::OtelSinkConfig;
use crate::errors::{ServiceError, ServiceResult};

use super::subscriber::{CategoryFilter, Subscriber};
use super::{Event, EventStatus};

pub struct OtelSubscriber {
    filter: CategoryFilter,
    tracer: SdkTracer,
}

impl OtelSubscriber {
    /// Installs a batched OTLP pipeline against the configured endpoint.
    /// Must be called from within a tokio runtime.
    pub fn new(config: &OtelSinkConfig) -> ServiceResult<Self> {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(config.endpoint.clone()),
            )
            .install_batch(opentelemetry::runtime::Tokio)
            .map_err(|e| {
                ServiceError::server("OBS-1006", format!("OTLP pipeline failed: {}", e))
            })?;

        Ok(Self {
            filter: CategoryFilter::from_names(&config.categories),
            tracer,
        })
    }
}

/// Flattens an event into span attributes.
fn span_attributes(event: &Event) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new("thunder.trace_id", event.trace_id.clone()),
        KeyValue::new("thunder.event_id", event.event_id.clone()),
        KeyValue::new("thunder.component", event.component.clone()),
        KeyValue::new("thunder.timestamp", event.timestamp.to_rfc3339()),
    ];
    if let serde_json::Value::Object(map) = &event.data {
        for (key, value) in map {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            attributes.push(KeyValue::new(format!("thunder.data.{}", key), rendered));
        }
    }
    attributes
}

#[async_trait]
impl Subscriber for OtelSubscriber {
    fn id(&self) -> &str {
        "opentelemetry"
    }

    fn categories(&self) -> &CategoryFilter {
        &self.filter
    }

    async fn on_event(&self, event: &Event) -> ServiceResult<()> {
        let mut span = self.tracer.start(event.event_type.clone());
        for attribute in span_attributes(event) {
            span.set_attribute(attribute);
        }
        match event.status {
            EventStatus::Success => span.set_status(StatusCode::Ok, String::new()),
            EventStatus::Failure => {
                span.set_status(StatusCode::Error, "event reported failure".to_string())
            }
            EventStatus::InProgress => {}
        }
        span.end();
        Ok(())
    }

    async fn close(&self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}
