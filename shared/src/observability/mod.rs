//! # Observability Events
//!
//! Structured events published by every subsystem and routed to subscribers
//! by category.
//!
//! ## Event shape
//!
//! | Field       | Meaning                                          |
//! |-------------|--------------------------------------------------|
//! | `trace_id`  | Request correlation id                           |
//! | `event_id`  | Unique id; idempotence key for downstream stores |
//! | `type`      | Dotted event type, e.g. `auth.flow.step`         |
//! | `component` | Emitting subsystem                               |
//! | `timestamp` | UTC emission time                                |
//! | `status`    | `in-progress` / `success` / `failure`            |
//! | `data`      | Free-form JSON payload                           |
//!
//! The category is derived from the first segment of the type
//! (`auth.started` → `authentication`, `token.issued` → `tokens`). Events
//! whose type prefix maps to no category are rejected at publish.

pub mod bus;
pub mod console;
pub mod file;
pub mod otel;
pub mod subscriber;

pub use bus::EventBus;
pub use subscriber::{CategoryFilter, EventFormatter, JsonFormatter, Subscriber};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Status
// =============================================================================

/// Outcome state carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventStatus {
    InProgress,
    Success,
    Failure,
}

// =============================================================================
// Category
// =============================================================================

/// Coarse routing classification.
///
/// `All` is a subscription wildcard, never a derived event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Authentication,
    Tokens,
    Sessions,
    Users,
    Applications,
    Flow,
    Oauth,
    #[serde(rename = "ALL")]
    All,
}

impl EventCategory {
    /// Derives the category from the first dotted segment of an event type.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        let prefix = event_type.split('.').next().unwrap_or("");
        match prefix {
            "auth" | "authentication" => Some(Self::Authentication),
            "token" | "tokens" => Some(Self::Tokens),
            "session" | "sessions" => Some(Self::Sessions),
            "user" | "users" => Some(Self::Users),
            "app" | "application" | "applications" => Some(Self::Applications),
            "flow" => Some(Self::Flow),
            "oauth" => Some(Self::Oauth),
            _ => None,
        }
    }

    /// Parses a configured category name (`ALL` accepted).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "authentication" => Some(Self::Authentication),
            "tokens" => Some(Self::Tokens),
            "sessions" => Some(Self::Sessions),
            "users" => Some(Self::Users),
            "applications" => Some(Self::Applications),
            "flow" => Some(Self::Flow),
            "oauth" => Some(Self::Oauth),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

// =============================================================================
// Event
// =============================================================================

/// A structured observability event. Append-only; idempotent by `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub trace_id: String,
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub component: String,
    pub timestamp: DateTime<Utc>,
    pub status: EventStatus,
    pub data: serde_json::Value,
}

impl Event {
    /// Starts an event of `event_type` emitted by `component`, with a fresh
    /// `event_id`, the current timestamp, and `in-progress` status.
    pub fn new(event_type: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            trace_id: String::new(),
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            component: component.into(),
            timestamp: Utc::now(),
            status: EventStatus::InProgress,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// The derived routing category, if the type prefix is recognized.
    pub fn category(&self) -> Option<EventCategory> {
        EventCategory::from_event_type(&self.event_type)
    }

    /// Publish-time validation: required fields present and the type prefix
    /// maps to a known category.
    pub fn validate(&self) -> Result<EventCategory, &'static str> {
        if self.event_id.is_empty() {
            return Err("missing event_id");
        }
        if self.event_type.is_empty() {
            return Err("missing type");
        }
        if self.component.is_empty() {
            return Err("missing component");
        }
        self.category().ok_or("unrecognized event type prefix")
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// Builds the event bus with the subscribers enabled in configuration.
///
/// A disabled observability section yields a bus with no subscribers: every
/// publish takes the smart-publishing fast path.
pub fn build_event_bus(
    config: &crate::config::ObservabilityConfig,
) -> crate::errors::ServiceResult<EventBus> {
    let bus = EventBus::new();
    if !config.enabled {
        return Ok(bus);
    }
    if config.output.console.enabled {
        bus.subscribe(std::sync::Arc::new(console::ConsoleSubscriber::new(
            &config.output.console,
        )));
    }
    if config.output.file.enabled {
        bus.subscribe(std::sync::Arc::new(file::FileSubscriber::new(
            &config.output.file,
        )?));
    }
    if config.output.opentelemetry.enabled {
        bus.subscribe(std::sync::Arc::new(otel::OtelSubscriber::new(
            &config.output.opentelemetry,
        )?));
    }
    Ok(bus)
}

// =============================================================================
// Tests
// =============================================================================
