//! # Tracing Bootstrap
//!
//! Structured-logging initialization: pretty, colorized output in
//! development; JSON in production for log aggregation. Verbosity is
//! controlled via `RUST_LOG` with sensible per-environment defaults.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initializes the tracing subscriber. Call once, before anything logs.
///
/// `RUST_LOG` overrides the defaults (`info` in production,
/// `debug,hyper=info,sqlx=warn` otherwise).
pub fn init_tracing(service_name: &str, json_output: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if json_output {
            EnvFilter::new("info")
        } else {
            EnvFilter::new("debug,hyper=info,sqlx=warn")
        }
    });

    if json_output {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true)
                    .with_current_span(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
    }

    tracing::info!(service = service_name, json = json_output, "tracing initialized");
}
