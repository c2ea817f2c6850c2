use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info, warn};
use wcs_core::{SessionEvent, TransportError, classify};

use crate::sink::SharedEventSink;
use crate::transport::SharedTransport;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh_token(&self) -> Result<String, TransportError>;
}

/// Refreshes through the transport currently bound to the conversation.
pub struct TransportTokenSource(pub SharedTransport);

#[async_trait]
impl TokenSource for TransportTokenSource {
    async fn refresh_token(&self) -> Result<String, TransportError> {
        self.0.refresh_token().await
    }
}

/// Periodic token refresh. The first refresh happens one full interval after
/// start. A single failure stops the loop and emits `tokenExpired` once.
pub struct TokenRefresher {
    handle: JoinHandle<()>,
}

impl TokenRefresher {
    pub fn spawn<F>(
        source: Arc<dyn TokenSource>,
        interval: Duration,
        events: SharedEventSink,
        on_refreshed: F,
    ) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let span = tracing::info_span!("webchat.token_refresh", interval_secs = interval.as_secs());
        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match source.refresh_token().await {
                        Ok(token) => {
                            info!("token refreshed");
                            on_refreshed(token);
                        }
                        Err(err) => {
                            let diagnosis = classify(&err);
                            warn!(
                                error = %err,
                                category = diagnosis.category.as_str(),
                                "token refresh failed, stopping refresher"
                            );
                            events.emit(&SessionEvent::TokenExpired);
                            break;
                        }
                    }
                }
                debug!("token refresher stopped");
            }
            .instrument(span),
        );
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TokenRefresher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
