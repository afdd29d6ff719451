//! Preference persistence
//!
//! Opaque key/value storage for registration and user preferences. The
//! host application decides where values actually live.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String);
    async fn remove(&self, key: &str);
}

/// In-memory store, the default when the host provides nothing better.
pub struct MemoryPreferenceStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.values.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: String) {
        self.values.write().await.insert(key.to_string(), value);
    }

    async fn remove(&self, key: &str) {
        self.values.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        tokio_test::block_on(async {
            let store = MemoryPreferenceStore::new();

            assert_eq!(store.get("registration.uri").await, None);

            store
                .set("registration.uri", "sip:alice@example.com".to_string())
                .await;
            assert_eq!(
                store.get("registration.uri").await.as_deref(),
                Some("sip:alice@example.com")
            );

            store.remove("registration.uri").await;
            assert_eq!(store.get("registration.uri").await, None);
        });
    }
}
