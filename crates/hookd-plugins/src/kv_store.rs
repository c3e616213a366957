//! Plugin-scoped key/value storage with optional expiry.

use std::collections::HashMap;

use async_trait::async_trait;
use hookd_core::{current_unix_timestamp_ms, expiry_from_now_ms, is_expired_unix_ms};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

pub const PLUGIN_KEY_MAX_LEN: usize = 150;

pub type KeyValueResult<T> = Result<T, KeyValueError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyValueError {
    #[error("plugin key must not be empty")]
    EmptyKey,
    #[error("plugin key exceeds {max} characters ({actual})")]
    KeyTooLong { max: usize, actual: usize },
}

/// Storage behind the `kv_*` capability calls. Keys are namespaced by plugin id.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set(
        &self,
        plugin_id: &str,
        key: &str,
        value: Value,
        expire_in_seconds: Option<u64>,
    ) -> KeyValueResult<()>;

    /// Expired entries read as absent.
    async fn get(&self, plugin_id: &str, key: &str) -> KeyValueResult<Option<Value>>;

    async fn delete(&self, plugin_id: &str, key: &str) -> KeyValueResult<()>;

    /// Removes every expired entry across all plugins and returns how many went.
    async fn delete_all_expired(&self) -> KeyValueResult<usize>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expire_at_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<(String, String), StoredValue>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn set_at(
        &self,
        plugin_id: &str,
        key: &str,
        value: Value,
        expire_in_seconds: Option<u64>,
        now_ms: u64,
    ) -> KeyValueResult<()> {
        validate_key(key)?;
        let stored = StoredValue {
            value,
            expire_at_ms: expiry_from_now_ms(now_ms, expire_in_seconds),
        };
        self.entries
            .write()
            .await
            .insert((plugin_id.to_string(), key.to_string()), stored);
        Ok(())
    }

    pub async fn get_at(
        &self,
        plugin_id: &str,
        key: &str,
        now_ms: u64,
    ) -> KeyValueResult<Option<Value>> {
        validate_key(key)?;
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(plugin_id.to_string(), key.to_string()))
            .filter(|stored| !is_expired_unix_ms(stored.expire_at_ms, now_ms))
            .map(|stored| stored.value.clone()))
    }

    pub async fn delete_expired_at(&self, now_ms: u64) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, stored| !is_expired_unix_ms(stored.expire_at_ms, now_ms));
        before - entries.len()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn set(
        &self,
        plugin_id: &str,
        key: &str,
        value: Value,
        expire_in_seconds: Option<u64>,
    ) -> KeyValueResult<()> {
        self.set_at(
            plugin_id,
            key,
            value,
            expire_in_seconds,
            current_unix_timestamp_ms(),
        )
        .await
    }

    async fn get(&self, plugin_id: &str, key: &str) -> KeyValueResult<Option<Value>> {
        self.get_at(plugin_id, key, current_unix_timestamp_ms()).await
    }

    async fn delete(&self, plugin_id: &str, key: &str) -> KeyValueResult<()> {
        validate_key(key)?;
        self.entries
            .write()
            .await
            .remove(&(plugin_id.to_string(), key.to_string()));
        Ok(())
    }

    async fn delete_all_expired(&self) -> KeyValueResult<usize> {
        Ok(self.delete_expired_at(current_unix_timestamp_ms()).await)
    }
}

fn validate_key(key: &str) -> KeyValueResult<()> {
    if key.is_empty() {
        return Err(KeyValueError::EmptyKey);
    }
    let actual = key.chars().count();
    if actual > PLUGIN_KEY_MAX_LEN {
        return Err(KeyValueError::KeyTooLong {
            max: PLUGIN_KEY_MAX_LEN,
            actual,
        });
    }
    Ok(())
}
