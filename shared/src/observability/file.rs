//! File subscriber: buffered JSON-line output with periodic flushes and
//! size-based rotation.
//!
//! Events are appended to an in-memory buffer and written out either when
//! the buffer passes [`FLUSH_THRESHOLD_BYTES`] or when the periodic flusher
//! fires. When the active file exceeds the configured maximum size it is
//! renamed to `<path>.<utc-timestamp>` and a fresh file is started.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::FileSinkConfig;
use crate::errors::{ServiceError, ServiceResult};

use super::subscriber::{CategoryFilter, EventFormatter, JsonFormatter, Subscriber};
use super::Event;

/// Buffer high-water mark that forces an immediate flush.
const FLUSH_THRESHOLD_BYTES: usize = 64 * 1024;

pub struct FileSubscriber {
    filter: CategoryFilter,
    formatter: JsonFormatter,
    sink: Arc<Mutex<FileSink>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

struct FileSink {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    buffer: Vec<u8>,
}

impl FileSink {
    fn open(path: PathBuf, max_size: u64) -> ServiceResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::server("OBS-1002", format!("cannot create log directory: {}", e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                ServiceError::server("OBS-1002", format!("cannot open {}: {}", path.display(), e))
            })?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { path, file, written, max_size, buffer: Vec::new() })
    }

    fn append(&mut self, bytes: &[u8]) -> ServiceResult<()> {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() >= FLUSH_THRESHOLD_BYTES {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> ServiceResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(&self.buffer)
            .map_err(|e| ServiceError::server("OBS-1003", format!("log write failed: {}", e)))?;
        self.written += self.buffer.len() as u64;
        self.buffer.clear();

        if self.written >= self.max_size {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> ServiceResult<()> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let rotated = self.path.with_extension(format!("log.{}", stamp));
        let _ = self.file.flush();
        std::fs::rename(&self.path, &rotated)
            .map_err(|e| ServiceError::server("OBS-1004", format!("rotation failed: {}", e)))?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                ServiceError::server("OBS-1004", format!("cannot reopen after rotation: {}", e))
            })?;
        self.written = 0;
        Ok(())
    }
}

impl FileSubscriber {
    /// Opens the sink and starts the periodic flusher task.
    pub fn new(config: &FileSinkConfig) -> ServiceResult<Self> {
        let sink = Arc::new(Mutex::new(FileSink::open(
            PathBuf::from(&config.path),
            config.max_size_bytes,
        )?));

        let flusher_sink = sink.clone();
        let interval = Duration::from_secs(config.flush_interval_seconds.max(1));
        let flusher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Ok(mut sink) = flusher_sink.lock() {
                    if let Err(e) = sink.flush() {
                        warn!(error = %e, "periodic event-log flush failed");
                    }
                }
            }
        });

        Ok(Self {
            filter: CategoryFilter::from_names(&config.categories),
            formatter: JsonFormatter,
            sink,
            flusher: Mutex::new(Some(flusher)),
        })
    }
}

#[async_trait]
impl Subscriber for FileSubscriber {
    fn id(&self) -> &str {
        "file"
    }

    fn categories(&self) -> &CategoryFilter {
        &self.filter
    }

    async fn on_event(&self, event: &Event) -> ServiceResult<()> {
        let bytes = self.formatter.format(event)?;
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| ServiceError::server("OBS-1005", "file sink lock poisoned"))?;
        sink.append(&bytes)
    }

    async fn close(&self) {
        if let Ok(mut handle) = self.flusher.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
        if let Ok(mut sink) = self.sink.lock() {
            if let Err(e) = sink.flush() {
                warn!(error = %e, "final event-log flush failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
