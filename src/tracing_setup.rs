use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::models::LoggingConfig;

/// Initialize tracing from the `[logging]` section. `RUST_LOG`, when set,
/// overrides the configured level.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone());
    init_tracing_with_config(&level, logging.json, logging.json)
}

/// Initialize tracing with custom configuration
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let initialized = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    initialized.wrap_err("A global tracing subscriber is already installed")?;

    tracing::info!(
        level,
        json = json_format,
        spans = include_spans,
        "Atrium logging initialized"
    );
    Ok(())
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        app.context_path = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Span covering the application of one definition file change
pub fn create_reload_span(file: &str) -> tracing::Span {
    tracing::info_span!(
        "reload",
        config.file = file,
        app.context_path = tracing::field::Empty,
        outcome = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(init_tracing_with_config("atrium=notalevel", false, false).is_err());
    }

    #[test]
    fn test_create_request_span() {
        let span = create_request_span("GET", "/shop/cart", "req-123");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "request");
        }
    }

    #[test]
    fn test_create_reload_span() {
        let span = create_reload_span("/srv/webapps/shop/app.json");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "reload");
        }
    }
}
