use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use wcs_core::{Activity, TransportError};
use wcs_telemetry::{SessionLabels, record_counter, record_histogram};

use crate::transport::Transport;

pub const DEFAULT_SEND_ATTEMPTS: u32 = 3;
pub const DEFAULT_SEND_BASE_DELAY: Duration = Duration::from_secs(1);

/// Acknowledgement of a posted activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub id: String,
    /// Round-trip of the successful attempt only.
    pub latency: Duration,
    pub attempts: u32,
}

/// Bounded retry around `Transport::post_activity`.
#[derive(Debug, Clone, Copy)]
pub struct SendQueue {
    attempts: u32,
    base_delay: Duration,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_SEND_ATTEMPTS,
            base_delay: DEFAULT_SEND_BASE_DELAY,
        }
    }
}

impl SendQueue {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait after the 0-based failed attempt `index`.
    pub fn delay_for(&self, index: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(index.min(16)))
    }

    /// Posts `activity`, retrying transient failures. The final error is
    /// returned exactly as the transport produced it.
    pub async fn post(
        &self,
        transport: &dyn Transport,
        activity: &Activity,
        labels: &SessionLabels,
    ) -> Result<SendReceipt, TransportError> {
        let mut index = 0;
        loop {
            let started = Instant::now();
            match transport.post_activity(activity).await {
                Ok(id) => {
                    let latency = started.elapsed();
                    record_histogram(
                        "webchat_client_send_roundtrip_seconds",
                        latency.as_secs_f64(),
                        labels,
                    );
                    debug!(activity_id = %id, attempts = index + 1, ?latency, "activity posted");
                    return Ok(SendReceipt {
                        id,
                        latency,
                        attempts: index + 1,
                    });
                }
                Err(err) if err.is_transient() && index + 1 < self.attempts => {
                    let delay = self.delay_for(index);
                    warn!(
                        attempt = index + 1,
                        max_attempts = self.attempts,
                        ?delay,
                        error = %err,
                        "send failed, retrying"
                    );
                    record_counter("webchat_client_send_retries_total", 1, labels);
                    tokio::time::sleep(delay).await;
                    index += 1;
                }
                Err(err) => {
                    warn!(attempts = index + 1, error = %err, "send failed");
                    record_counter(
                        "webchat_client_send_failures_total",
                        1,
                        &labels.clone().with("transient", err.is_transient().to_string()),
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use http::StatusCode;
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::{ConversationInfo, TransportEvent};

    #[derive(Default)]
    struct FlakyTransport {
        failures: Mutex<VecDeque<TransportError>>,
        calls: AtomicU32,
    }

    impl FlakyTransport {
        fn failing_with(errors: Vec<TransportError>) -> Self {
            Self {
                failures: Mutex::new(errors.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
            None
        }

        async fn post_activity(&self, _activity: &Activity) -> Result<String, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failures.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(format!("id-{call}")),
            }
        }

        fn conversation(&self) -> ConversationInfo {
            ConversationInfo::default()
        }

        async fn end(&self) {}
    }

    fn remote(status: StatusCode) -> TransportError {
        TransportError::Remote {
            status,
            retry_after: None,
            message: String::new(),
        }
    }

    #[test]
    fn delays_double() {
        let queue = SendQueue::default();
        assert_eq!(queue.delay_for(0), Duration::from_secs(1));
        assert_eq!(queue.delay_for(1), Duration::from_secs(2));
        assert_eq!(queue.delay_for(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_with_backoff() {
        let transport = FlakyTransport::failing_with(vec![
            TransportError::Timeout,
            remote(StatusCode::SERVICE_UNAVAILABLE),
        ]);
        let started = Instant::now();
        let receipt = SendQueue::default()
            .post(&transport, &Activity::message("hi"), &SessionLabels::new("test"))
            .await
            .unwrap();

        assert_eq!(receipt.attempts, 3);
        assert_eq!(receipt.id, "id-2");
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error_untouched() {
        let transport = FlakyTransport::failing_with(vec![
            TransportError::Timeout,
            TransportError::Timeout,
            remote(StatusCode::BAD_GATEWAY),
        ]);
        let err = SendQueue::default()
            .post(&transport, &Activity::message("hi"), &SessionLabels::new("test"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let transport = FlakyTransport::failing_with(vec![remote(StatusCode::FORBIDDEN)]);
        let err = SendQueue::default()
            .post(&transport, &Activity::message("hi"), &SessionLabels::new("test"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
