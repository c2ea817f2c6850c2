use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{credential::Credential, status::SessionStatus};

/// The single logical conversation owned by a connection controller.
#[derive(Debug, Clone)]
pub struct Session {
    pub credential: Credential,
    pub conversation_id: Option<String>,
    pub watermark: Option<String>,
    pub stream_url: Option<String>,
    /// Conversation-scoped token issued by the service, for any credential kind.
    pub conversation_token: Option<String>,
    pub status: SessionStatus,
    pub retry_count: u32,
    pub last_activity_at: Option<OffsetDateTime>,
}

impl Session {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            conversation_id: None,
            watermark: None,
            stream_url: None,
            conversation_token: None,
            status: SessionStatus::Uninitialized,
            retry_count: 0,
            last_activity_at: None,
        }
    }

    /// Token currently usable to resume the conversation, if any. A secret
    /// is never handed out; only the token the service issued for the
    /// conversation is.
    pub fn token(&self) -> Option<&str> {
        if let Some(token) = self.conversation_token.as_deref() {
            return Some(token);
        }
        match &self.credential {
            Credential::Token(token) => Some(token.as_str()),
            Credential::Secret(_) => None,
        }
    }

    pub fn persisted(&self) -> Option<PersistedSession> {
        Some(PersistedSession {
            conversation_id: self.conversation_id.clone()?,
            watermark: self.watermark.clone(),
            token: self.token()?.to_string(),
        })
    }
}

/// Caller-owned state sufficient to resume a conversation after a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub conversation_id: String,
    #[serde(default)]
    pub watermark: Option<String>,
    pub token: String,
}

/// Parameters for `resume_conversation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeParams {
    pub conversation_id: String,
    pub token: String,
    #[serde(default)]
    pub watermark: Option<String>,
    #[serde(default)]
    pub stream_url: Option<String>,
}

impl From<PersistedSession> for ResumeParams {
    fn from(persisted: PersistedSession) -> Self {
        Self {
            conversation_id: persisted.conversation_id,
            token: persisted.token,
            watermark: persisted.watermark,
            stream_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_sessions_persist_only_the_conversation_token() {
        let mut session = Session::new(Credential::secret("AbCdEfGhIjKlMnOpQrStUvWx"));
        session.conversation_id = Some("conv-1".into());
        assert!(session.persisted().is_none());

        session.conversation_token = Some("conv-token-1".into());
        let persisted = session.persisted().unwrap();
        assert_eq!(persisted.token, "conv-token-1");
        assert_eq!(persisted.conversation_id, "conv-1");
    }

    #[test]
    fn token_sessions_persist_resume_state() {
        let mut session = Session::new(Credential::token("tok-AbCdEfGhIjKlMnOpQrSt"));
        assert!(session.persisted().is_none());
        session.conversation_id = Some("conv-1".into());
        session.watermark = Some("7".into());
        let persisted = session.persisted().unwrap();
        assert_eq!(persisted.conversation_id, "conv-1");
        assert_eq!(persisted.watermark.as_deref(), Some("7"));

        let resume = ResumeParams::from(persisted);
        assert_eq!(resume.token, "tok-AbCdEfGhIjKlMnOpQrSt");
        assert!(resume.stream_url.is_none());
    }
}
