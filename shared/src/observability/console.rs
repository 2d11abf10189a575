//! Console subscriber: formats events as JSON lines on stdout.

use std::io::Write;

use async_trait::async_trait;

use crate::config::ConsoleSinkConfig;
use crate::errors::{ServiceError, ServiceResult};

use super::subscriber::{CategoryFilter, EventFormatter, JsonFormatter, Subscriber};
use super::Event;

pub struct ConsoleSubscriber {
    filter: CategoryFilter,
    formatter: JsonFormatter,
}

impl ConsoleSubscriber {
    pub fn new(config: &ConsoleSinkConfig) -> Self {
        Self {
            filter: CategoryFilter::from_names(&config.categories),
            formatter: JsonFormatter,
        }
    }
}

#[async_trait]
impl Subscriber for ConsoleSubscriber {
    fn id(&self) -> &str {
        "console"
    }

    fn categories(&self) -> &CategoryFilter {
        &self.filter
    }

    async fn on_event(&self, event: &Event) -> ServiceResult<()> {
        let bytes = self.formatter.format(event)?;
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(&bytes)
            .map_err(|e| ServiceError::server("OBS-1001", format!("stdout write failed: {}", e)))
    }

    async fn close(&self) {
        let _ = std::io::stdout().flush();
    }
}
