//! Core contracts for the webchat session client.
//!
//! This crate holds the value types shared between the connection controller and
//! its consumers: the Bot Framework activity model, connection statuses, the
//! typed events emitted to a rendering layer, the error taxonomy, and the options
//! recognised when a session is initialised.
#![forbid(unsafe_code)]

pub mod activity;
pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod session;
pub mod status;

pub use activity::{Activity, ActivityType, Attachment, CardAction, ChannelAccount, SuggestedActions};
pub use config::{DEFAULT_DIRECT_LINE_DOMAIN, SessionOptions};
pub use credential::{Credential, MIN_SECRET_LENGTH, validate_secret};
pub use error::{
    BoxError, ErrorCategory, ErrorDiagnosis, SessionError, TransportError, ValidationError,
    classify,
};
pub use events::{ConnectionQuality, HealthMetrics, SessionEvent, Troubleshooting};
pub use session::{PersistedSession, ResumeParams, Session};
pub use status::{ConnectionStatus, SessionStatus};
