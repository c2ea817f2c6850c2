//! Lightweight telemetry helpers for the webchat session client.
//! Provides subscriber installation, span constructors and metric recorders.

use anyhow::Result;
use tracing::info_span;

mod config;
mod metrics;
mod tracing_init;

pub use config::TelemetryConfig;
pub use metrics::{SessionLabels, record_counter, record_gauge, record_histogram};
pub use tracing_init::{init_tracing, tracing_installed};

/// Installs the shared subscriber configured from `RUST_LOG` and `LOG_FORMAT`.
pub fn install(service_name: &str) -> Result<()> {
    init_tracing(&TelemetryConfig::from_env(
        service_name,
        env!("CARGO_PKG_VERSION"),
    ))
}

pub fn span_for_session(action: &'static str, conversation_id: Option<&str>) -> tracing::Span {
    info_span!(
        "webchat.session",
        action,
        conversation_id = conversation_or_dash(conversation_id)
    )
}

pub fn span_for_activity(
    action: &'static str,
    conversation_id: Option<&str>,
    activity_id: &str,
) -> tracing::Span {
    info_span!(
        "webchat.activity",
        action,
        conversation_id = conversation_or_dash(conversation_id),
        activity_id
    )
}

pub fn conversation_or_dash(conversation_id: Option<&str>) -> &str {
    conversation_id.filter(|s| !s.is_empty()).unwrap_or("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        install("webchat-session-test").unwrap();
        install("webchat-session-test").unwrap();
        assert!(tracing_installed());
    }

    #[test]
    fn dash_for_missing_conversation() {
        assert_eq!(conversation_or_dash(None), "-");
        assert_eq!(conversation_or_dash(Some("")), "-");
        assert_eq!(conversation_or_dash(Some("c-1")), "c-1");
    }
}
