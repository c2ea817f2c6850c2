//! Adapter seam between the connection controller and a concrete protocol client.

pub mod directline;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use wcs_core::{
    Activity, ConnectionStatus, Credential, ResumeParams, SessionError, SessionOptions,
    TransportError,
};

pub use directline::{DirectLineProvider, DirectLineTransport};

/// Items delivered on a transport's single ordered event stream.
#[derive(Debug)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    Activity(Box<Activity>),
    Watermark(String),
    /// A low-level failure the transport observed; always followed by a status.
    Failure(TransportError),
}

/// Everything a provider needs to open (or reopen) a conversation.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub credential: Credential,
    pub options: SessionOptions,
    pub resume: Option<ResumeParams>,
}

/// Snapshot of the conversation a transport is bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationInfo {
    pub conversation_id: Option<String>,
    pub token: Option<String>,
    pub stream_url: Option<String>,
    pub watermark: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands out the event stream. Only the first call returns `Some`.
    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Posts an activity and returns the id assigned by the service.
    async fn post_activity(&self, activity: &Activity) -> Result<String, TransportError>;

    fn supports_token_refresh(&self) -> bool {
        false
    }

    async fn refresh_token(&self) -> Result<String, TransportError> {
        Err(TransportError::Unsupported("token refresh"))
    }

    fn conversation(&self) -> ConversationInfo;

    /// Stops receiving and releases network resources.
    async fn end(&self);
}

pub type SharedTransport = Arc<dyn Transport>;

pub trait TransportProvider: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }

    /// Builds a transport and starts connecting in the background. Must be
    /// called from within a Tokio runtime.
    fn connect(&self, params: TransportParams) -> Result<SharedTransport, TransportError>;

    fn supports_resume(&self) -> bool {
        false
    }

    fn resume(&self, _params: TransportParams) -> Result<SharedTransport, TransportError> {
        Err(TransportError::Unsupported("resume"))
    }
}

pub type SharedTransportProvider = Arc<dyn TransportProvider>;

/// Picks a transport provider from an ordered fallback list.
///
/// The order is configuration data; resolution happens once, before the
/// controller is built.
#[derive(Clone, Default)]
pub struct TransportResolver {
    order: Vec<String>,
    providers: Vec<SharedTransportProvider>,
}

impl TransportResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order = order.into_iter().map(Into::into).collect();
        self
    }

    pub fn register(mut self, provider: SharedTransportProvider) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn resolve(&self) -> Result<SharedTransportProvider, SessionError> {
        let candidates: Vec<&SharedTransportProvider> = if self.order.is_empty() {
            self.providers.iter().collect()
        } else {
            self.order
                .iter()
                .filter_map(|name| self.providers.iter().find(|p| p.name() == name))
                .collect()
        };

        for provider in candidates {
            if provider.is_available() {
                debug!(provider = provider.name(), "transport provider resolved");
                return Ok(Arc::clone(provider));
            }
            debug!(provider = provider.name(), "transport provider unavailable, trying next");
        }

        Err(SessionError::TransportUnavailable(if self.order.is_empty() {
            "no transport providers registered".to_string()
        } else {
            format!("none of [{}] is available", self.order.join(", "))
        }))
    }
}
