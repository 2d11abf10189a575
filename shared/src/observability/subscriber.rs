//! Subscriber and formatter contracts for the event bus.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::errors::ServiceResult;

use super::{Event, EventCategory};

// =============================================================================
// Category Filter
// =============================================================================

/// The categories a subscriber declared at subscribe time.
#[derive(Debug, Clone)]
pub enum CategoryFilter {
    /// Wildcard: receive every category.
    All,
    /// Receive only the listed categories.
    Only(HashSet<EventCategory>),
}

impl CategoryFilter {
    /// Builds a filter from configured category names; `ALL` anywhere in the
    /// list makes the filter a wildcard. Unrecognized names are skipped.
    pub fn from_names(names: &[String]) -> Self {
        let mut set = HashSet::new();
        for name in names {
            match EventCategory::parse(name) {
                Some(EventCategory::All) => return Self::All,
                Some(category) => {
                    set.insert(category);
                }
                None => {
                    tracing::warn!(category = %name, "ignoring unknown event category");
                }
            }
        }
        Self::Only(set)
    }

    pub fn matches(&self, category: EventCategory) -> bool {
        match self {
            Self::All => true,
            Self::Only(set) => set.contains(&category),
        }
    }
}

// =============================================================================
// Formatter
// =============================================================================

/// Renders an event to bytes for an output adapter.
pub trait EventFormatter: Send + Sync {
    fn format(&self, event: &Event) -> ServiceResult<Vec<u8>>;
}

/// Newline-delimited JSON formatter used by the console and file sinks.
#[derive(Debug, Default, Clone)]
pub struct JsonFormatter;

impl EventFormatter for JsonFormatter {
    fn format(&self, event: &Event) -> ServiceResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec(event)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

// =============================================================================
// Subscriber
// =============================================================================

/// A consumer of the event bus.
///
/// The bus filters by category before dispatch; `accepts_type` lets a
/// subscriber additionally skip event types it has no use for, before any
/// formatter work happens. An `on_event` error is logged by the bus; the
/// subscriber is neither retried nor removed.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Stable identifier, unique within the bus.
    fn id(&self) -> &str;

    /// Categories declared at subscribe time.
    fn categories(&self) -> &CategoryFilter;

    /// Subscriber-side exact-type filter. Defaults to accepting everything.
    fn accepts_type(&self, _event_type: &str) -> bool {
        true
    }

    /// Handles one event.
    async fn on_event(&self, event: &Event) -> ServiceResult<()>;

    /// Flushes and releases resources. Called once during bus shutdown,
    /// after all in-flight dispatches have drained.
    async fn close(&self);
}

// =============================================================================
// Tests
// =============================================================================
