use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};
use wcs_core::{ConnectionQuality, SessionOptions};

const LATENCY_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveType {
    Slow2g,
    G2,
    G3,
    G4,
}

/// One observation of the network the client is running on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSample {
    pub effective_type: EffectiveType,
    pub downlink_mbps: f64,
    pub rtt_ms: f64,
}

/// Source of network observations used for quality classification.
pub trait NetworkSignals: Send + Sync {
    /// `None` when nothing has been observed yet.
    fn sample(&self) -> Option<NetworkSample>;
}

pub fn classify_quality(sample: Option<&NetworkSample>) -> ConnectionQuality {
    let Some(sample) = sample else {
        return ConnectionQuality::Poor;
    };
    let NetworkSample {
        effective_type,
        downlink_mbps,
        rtt_ms,
    } = *sample;

    if effective_type == EffectiveType::G4 && downlink_mbps > 1.5 && rtt_ms < 100.0 {
        ConnectionQuality::Excellent
    } else if matches!(effective_type, EffectiveType::G4 | EffectiveType::G3)
        && downlink_mbps > 0.5
        && rtt_ms < 300.0
    {
        ConnectionQuality::Good
    } else if effective_type != EffectiveType::Slow2g && rtt_ms < 1000.0 {
        ConnectionQuality::Fair
    } else {
        ConnectionQuality::Poor
    }
}

/// Transport tuning derived from the current quality. Applied on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSuggestion {
    pub polling_interval: Duration,
    pub web_socket: bool,
}

impl TransportSuggestion {
    pub fn for_quality(quality: ConnectionQuality) -> Self {
        let (millis, web_socket) = match quality {
            ConnectionQuality::Excellent => (500, true),
            ConnectionQuality::Good => (750, true),
            ConnectionQuality::Fair => (1_000, true),
            ConnectionQuality::Poor => (2_000, false),
        };
        Self {
            polling_interval: Duration::from_millis(millis),
            web_socket,
        }
    }

    pub fn apply(&self, options: &mut SessionOptions) {
        options.polling_interval_ms = self.polling_interval.as_millis() as u64;
        options.web_socket = self.web_socket;
    }
}

/// Derives network samples from observed request round-trips.
#[derive(Debug, Default)]
pub struct LatencySignals {
    window: Mutex<VecDeque<Duration>>,
}

impl LatencySignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, latency: Duration) {
        let Ok(mut window) = self.window.lock() else {
            return;
        };
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency);
    }

    /// Mean of the recent window in milliseconds.
    pub fn average_ms(&self) -> Option<f64> {
        let window = self.window.lock().ok()?;
        if window.is_empty() {
            return None;
        }
        let total: f64 = window.iter().map(|d| d.as_secs_f64() * 1_000.0).sum();
        Some(total / window.len() as f64)
    }
}

impl NetworkSignals for LatencySignals {
    fn sample(&self) -> Option<NetworkSample> {
        let rtt_ms = self.average_ms()?;
        let (effective_type, downlink_mbps) = if rtt_ms < 150.0 {
            (EffectiveType::G4, 2.0)
        } else if rtt_ms < 450.0 {
            (EffectiveType::G3, 0.7)
        } else if rtt_ms < 1_400.0 {
            (EffectiveType::G2, 0.25)
        } else {
            (EffectiveType::Slow2g, 0.05)
        };
        Some(NetworkSample {
            effective_type,
            downlink_mbps,
            rtt_ms,
        })
    }
}

/// Fixed signal source, mostly useful in tests and for hosts that already
/// know their link characteristics.
#[derive(Debug, Clone, Copy)]
pub struct StaticSignals(pub Option<NetworkSample>);

impl NetworkSignals for StaticSignals {
    fn sample(&self) -> Option<NetworkSample> {
        self.0
    }
}

pub struct NetworkQualityAdapter {
    signals: Arc<dyn NetworkSignals>,
    current: ConnectionQuality,
}

impl NetworkQualityAdapter {
    pub fn new(signals: Arc<dyn NetworkSignals>) -> Self {
        Self {
            signals,
            current: ConnectionQuality::Good,
        }
    }

    /// Reclassifies and returns `(old, new)` when the quality changed. Keeps
    /// the previous quality while the signal source has nothing to report.
    pub fn sample(&mut self) -> Option<(ConnectionQuality, ConnectionQuality)> {
        let Some(sample) = self.signals.sample() else {
            debug!(quality = self.current.as_str(), "no network sample yet");
            return None;
        };
        let quality = classify_quality(Some(&sample));
        debug!(quality = quality.as_str(), ?sample, "network sampled");
        if quality == self.current {
            return None;
        }
        let old = std::mem::replace(&mut self.current, quality);
        info!(
            old = old.as_str(),
            new = quality.as_str(),
            "connection quality changed"
        );
        Some((old, quality))
    }

    pub fn current(&self) -> ConnectionQuality {
        self.current
    }

    pub fn suggestion(&self) -> TransportSuggestion {
        TransportSuggestion::for_quality(self.current)
    }
}

/// Extra typing-timeout factor contributed by the link quality.
pub fn typing_penalty(quality: ConnectionQuality) -> f64 {
    match quality {
        ConnectionQuality::Poor => 1.0,
        ConnectionQuality::Fair => 0.5,
        ConnectionQuality::Good => 0.2,
        ConnectionQuality::Excellent => 0.0,
    }
}
