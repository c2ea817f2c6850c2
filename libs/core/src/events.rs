use serde::{Deserialize, Serialize};

use crate::{
    activity::Activity,
    error::{ErrorCategory, ErrorDiagnosis},
    status::SessionStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Poor => "poor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub messages_received: u64,
    pub average_latency_ms: f64,
    pub connection_uptime_ms: u64,
    pub reconnect_count: u32,
    pub connection_quality: ConnectionQuality,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            messages_received: 0,
            average_latency_ms: 0.0,
            connection_uptime_ms: 0,
            reconnect_count: 0,
            connection_quality: ConnectionQuality::Good,
        }
    }
}

/// Payload attached to the terminal `connectionFailed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Troubleshooting {
    pub domain: String,
    pub web_socket: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorDiagnosis>,
    pub steps: Vec<String>,
}

/// Events delivered to the rendering and observability layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum SessionEvent {
    ConnectionStatus {
        status: SessionStatus,
        message: String,
        code: u8,
    },
    MessageReceived {
        activity: Activity,
    },
    StreamingChunk {
        message_id: String,
        chunk_number: u32,
        duration_ms: u64,
        text: String,
    },
    StreamingEnd {
        message_id: String,
        chunk_count: u32,
        duration_ms: u64,
    },
    ConnectionError {
        category: ErrorCategory,
        message: String,
        suggestion: String,
    },
    ConnectionFailed {
        retry_count: u32,
        max_retries: u32,
        troubleshooting: Troubleshooting,
    },
    HealthUpdate {
        metrics: HealthMetrics,
    },
    NetworkQualityChanged {
        old_quality: ConnectionQuality,
        new_quality: ConnectionQuality,
    },
    TokenExpired,
    TokenRefreshRequired,
    TypingIndicator {
        active: bool,
        timeout_ms: Option<u64>,
    },
}

impl SessionEvent {
    pub fn status(status: SessionStatus) -> Self {
        SessionEvent::ConnectionStatus {
            status,
            message: status.message().to_string(),
            code: status.code(),
        }
    }

    pub fn error(diagnosis: ErrorDiagnosis) -> Self {
        SessionEvent::ConnectionError {
            category: diagnosis.category,
            message: diagnosis.message,
            suggestion: diagnosis.suggestion,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::ConnectionStatus { .. } => "connectionStatus",
            SessionEvent::MessageReceived { .. } => "messageReceived",
            SessionEvent::StreamingChunk { .. } => "streamingChunk",
            SessionEvent::StreamingEnd { .. } => "streamingEnd",
            SessionEvent::ConnectionError { .. } => "connectionError",
            SessionEvent::ConnectionFailed { .. } => "connectionFailed",
            SessionEvent::HealthUpdate { .. } => "healthUpdate",
            SessionEvent::NetworkQualityChanged { .. } => "networkQualityChanged",
            SessionEvent::TokenExpired => "tokenExpired",
            SessionEvent::TokenRefreshRequired => "tokenRefreshRequired",
            SessionEvent::TypingIndicator { .. } => "typingIndicator",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_camel_case_payloads() {
        let event = SessionEvent::StreamingEnd {
            message_id: "m-1".into(),
            chunk_count: 2,
            duration_ms: 40,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "streamingEnd",
                "payload": {"messageId": "m-1", "chunkCount": 2, "durationMs": 40}
            })
        );
        assert_eq!(
            serde_json::to_value(SessionEvent::TokenExpired).unwrap(),
            json!({"event": "tokenExpired"})
        );
    }

    #[test]
    fn status_event_carries_code_and_message() {
        match SessionEvent::status(SessionStatus::Online) {
            SessionEvent::ConnectionStatus {
                status,
                message,
                code,
            } => {
                assert_eq!(status, SessionStatus::Online);
                assert_eq!(code, 2);
                assert_eq!(message, "connected");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
