use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use wcs_core::{ConnectionQuality, HealthMetrics, SessionEvent};

use crate::network::{LatencySignals, NetworkQualityAdapter, NetworkSignals, TransportSuggestion};

pub const HEALTH_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Tracks uptime, latency and reconnects, and samples network quality.
pub struct HealthMonitor {
    network: NetworkQualityAdapter,
    latency: Arc<LatencySignals>,
    connected_at: Option<Instant>,
    reconnect_count: u32,
}

impl HealthMonitor {
    /// `signals` defaults to the latency window when the host provides none.
    pub fn new(latency: Arc<LatencySignals>, signals: Option<Arc<dyn NetworkSignals>>) -> Self {
        let signals = signals.unwrap_or_else(|| Arc::clone(&latency) as Arc<dyn NetworkSignals>);
        Self {
            network: NetworkQualityAdapter::new(signals),
            latency,
            connected_at: None,
            reconnect_count: 0,
        }
    }

    pub fn mark_online(&mut self) {
        if self.connected_at.is_none() {
            self.connected_at = Some(Instant::now());
        }
    }

    pub fn mark_offline(&mut self) {
        self.connected_at = None;
    }

    pub fn record_reconnect(&mut self) {
        self.reconnect_count = self.reconnect_count.saturating_add(1);
    }

    pub fn reset_reconnects(&mut self) {
        self.reconnect_count = 0;
    }

    pub fn metrics(&self, messages_received: u64) -> HealthMetrics {
        HealthMetrics {
            messages_received,
            average_latency_ms: self.latency.average_ms().unwrap_or(0.0),
            connection_uptime_ms: self
                .connected_at
                .map(|at| at.elapsed().as_millis() as u64)
                .unwrap_or(0),
            reconnect_count: self.reconnect_count,
            connection_quality: self.network.current(),
        }
    }

    /// Periodic sample: quality change (if any) followed by the health update.
    pub fn sample(&mut self, messages_received: u64) -> Vec<SessionEvent> {
        let mut events = Vec::with_capacity(2);
        if let Some((old_quality, new_quality)) = self.network.sample() {
            events.push(SessionEvent::NetworkQualityChanged {
                old_quality,
                new_quality,
            });
        }
        events.push(SessionEvent::HealthUpdate {
            metrics: self.metrics(messages_received),
        });
        events
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.network.current()
    }

    pub fn suggestion(&self) -> TransportSuggestion {
        self.network.suggestion()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn uptime_and_reconnects_are_tracked() {
        let latency = Arc::new(LatencySignals::new());
        let mut monitor = HealthMonitor::new(Arc::clone(&latency), None);
        assert_eq!(monitor.metrics(0).connection_uptime_ms, 0);

        monitor.mark_online();
        monitor.record_reconnect();
        tokio::time::advance(Duration::from_secs(5)).await;
        latency.record(Duration::from_millis(120));

        let metrics = monitor.metrics(3);
        assert_eq!(metrics.connection_uptime_ms, 5_000);
        assert_eq!(metrics.reconnect_count, 1);
        assert_eq!(metrics.messages_received, 3);
        assert!((metrics.average_latency_ms - 120.0).abs() < 1e-6);

        monitor.reset_reconnects();
        monitor.mark_offline();
        assert_eq!(monitor.metrics(3).reconnect_count, 0);
        assert_eq!(monitor.metrics(3).connection_uptime_ms, 0);
    }

    #[test]
    fn quality_change_precedes_health_update() {
        let latency = Arc::new(LatencySignals::new());
        let mut monitor = HealthMonitor::new(Arc::clone(&latency), None);
        assert_eq!(monitor.sample(0).len(), 1);

        latency.record(Duration::from_millis(2_500));
        let events = monitor.sample(0);
        let names: Vec<_> = events.iter().map(SessionEvent::name).collect();
        assert_eq!(names, ["networkQualityChanged", "healthUpdate"]);
        assert_eq!(monitor.quality(), ConnectionQuality::Poor);
        assert!(!monitor.suggestion().web_socket);

        assert_eq!(monitor.sample(0).len(), 1);
    }
}
