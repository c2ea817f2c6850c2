use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use wcs_core::PersistedSession;

/// Shared persisted-session store handle.
pub type SharedSessionStore = Arc<dyn SessionStore>;

/// Keeps resumable conversation state keyed by local user id, so a host can
/// resume after a reload.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<PersistedSession>>;
    async fn save(&self, user_id: &str, session: PersistedSession) -> Result<()>;
    /// No-op when nothing is stored for `user_id`.
    async fn update_watermark(&self, user_id: &str, watermark: Option<String>) -> Result<()>;
    async fn clear(&self, user_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    by_user: DashMap<String, PersistedSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, user_id: &str) -> Result<Option<PersistedSession>> {
        Ok(self
            .by_user
            .get(user_id)
            .map(|entry| entry.value().clone()))
    }

    async fn save(&self, user_id: &str, session: PersistedSession) -> Result<()> {
        self.by_user.insert(user_id.to_string(), session);
        Ok(())
    }

    async fn update_watermark(&self, user_id: &str, watermark: Option<String>) -> Result<()> {
        if let Some(mut entry) = self.by_user.get_mut(user_id) {
            entry.watermark = watermark;
        }
        Ok(())
    }

    async fn clear(&self, user_id: &str) -> Result<()> {
        self.by_user.remove(user_id);
        Ok(())
    }
}

/// Returns an in-memory store wrapped in an [`Arc`].
pub fn shared_memory_store() -> SharedSessionStore {
    Arc::new(MemorySessionStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(watermark: Option<&str>) -> PersistedSession {
        PersistedSession {
            conversation_id: "conv-1".into(),
            watermark: watermark.map(str::to_string),
            token: "tok-AbCdEfGhIjKlMnOpQrSt".into(),
        }
    }

    #[tokio::test]
    async fn save_load_and_clear() {
        let store = shared_memory_store();
        assert!(store.load("user-1").await.unwrap().is_none());

        store.save("user-1", persisted(Some("1"))).await.unwrap();
        store
            .update_watermark("user-1", Some("5".into()))
            .await
            .unwrap();
        let loaded = store.load("user-1").await.unwrap().unwrap();
        assert_eq!(loaded.watermark.as_deref(), Some("5"));

        store.clear("user-1").await.unwrap();
        assert!(store.load("user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watermark_update_without_record_is_ignored() {
        let store = MemorySessionStore::new();
        store
            .update_watermark("nobody", Some("3".into()))
            .await
            .unwrap();
        assert!(store.load("nobody").await.unwrap().is_none());
    }
}
