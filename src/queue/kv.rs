//! Key-value collaborator for cross-process task coordination.
//!
//! Production deployments back this with a shared store (Redis or similar)
//! so a stop request issued against one process is observed by the worker
//! actually driving the run. Tests use [`InMemoryKvStore`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::core::{RealTimeProvider, TimeProvider};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64);
    async fn exists(&self, key: &str) -> bool;
    async fn delete(&self, key: &str);
}

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// TTL-aware in-process store. Expiry is lazy, checked on read against the
/// injected clock so tests can advance time deterministically.
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    time_provider: Arc<dyn TimeProvider>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_time_provider(Arc::new(RealTimeProvider))
    }

    pub fn with_time_provider(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            time_provider,
        }
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = self.time_provider.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.live_value(key)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) {
        let expires_at = self.time_provider.now() + chrono::Duration::seconds(ttl_secs as i64);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    async fn exists(&self, key: &str) -> bool {
        self.live_value(key).is_some()
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}
