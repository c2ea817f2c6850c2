//! Session management for Direct Line webchat clients.
//!
//! The [`ConnectionController`] owns one conversation: it connects through a
//! pluggable [`TransportProvider`], retries with backoff, refreshes tokens,
//! reassembles streamed replies and reports everything as typed
//! [`SessionEvent`](wcs_core::SessionEvent)s on an injected [`EventSink`].

#![forbid(unsafe_code)]

pub mod controller;
pub mod dispatcher;
pub mod health;
pub mod network;
pub mod retry;
pub mod send_queue;
pub mod sink;
pub mod store;
pub mod streaming;
pub mod token;
pub mod transport;

pub use controller::{
    ConnectionController, ControllerBuilder, DEFAULT_SETTLE_DELAY, GREETING_EVENT_NAME,
};
pub use dispatcher::{
    ActivityDispatcher, BASE_TYPING_TIMEOUT, DispatchOutcome, MAX_TYPING_TIMEOUT, TypingAction,
    typing_timeout,
};
pub use health::{HEALTH_SAMPLE_INTERVAL, HealthMonitor};
pub use network::{
    EffectiveType, LatencySignals, NetworkQualityAdapter, NetworkSample, NetworkSignals,
    StaticSignals, TransportSuggestion, classify_quality,
};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use send_queue::{SendQueue, SendReceipt};
pub use sink::{BroadcastSink, EventSink, NoopSink, SharedEventSink};
pub use store::{MemorySessionStore, SessionStore, SharedSessionStore, shared_memory_store};
pub use streaming::{Classification, StreamOutcome, StreamingReassembler, stream_key};
pub use token::{DEFAULT_REFRESH_INTERVAL, TokenRefresher, TokenSource, TransportTokenSource};
pub use transport::{
    ConversationInfo, DirectLineProvider, DirectLineTransport, SharedTransport,
    SharedTransportProvider, Transport, TransportEvent, TransportParams, TransportProvider,
    TransportResolver,
};
