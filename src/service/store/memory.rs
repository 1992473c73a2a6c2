//! In-process conversation backend, used for tests and `--ephemeral` runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::base::types::HistoryEntry;

use super::{GenericConversationBackend, StoreError};

#[derive(Default)]
pub struct MemoryConversationBackend {
    records: RwLock<HashMap<String, Vec<HistoryEntry>>>,
}

#[async_trait]
impl GenericConversationBackend for MemoryConversationBackend {
    async fn load(&self, key: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.records.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn save(&self, key: &str, entries: &[HistoryEntry]) -> Result<(), StoreError> {
        self.records.write().await.insert(key.to_string(), entries.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self.records.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
