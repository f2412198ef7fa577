//! Redis cache integration
//!
//! Holds the two transient data sets the service keeps outside the
//! relational store: in-flight conversation bodies and embedding results.
//! Single-key operations only; every value is JSON.

use crate::errors::{AppError, Result};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

/// Conversation bodies live for a day of inactivity
pub const CONVERSATION_TTL_SECS: u64 = 24 * 60 * 60;

/// Cached embeddings are stable for the lifetime of the model, keep a week
pub const EMBEDDING_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Redis cache client
pub struct Cache {
    connection: RwLock<MultiplexedConnection>,
}

impl Cache {
    /// Connect to redis and verify the connection with a ping
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| AppError::Cache(format!("failed to create redis client: {e}")))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Cache(format!("failed to connect to redis: {e}")))?;

        let cache = Self {
            connection: RwLock::new(connection),
        };
        cache.ping().await?;

        Ok(cache)
    }

    /// Get a value from cache
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.connection.write().await;

        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| AppError::Cache(format!("failed to get key '{key}': {e}")))?;

        match value {
            Some(json) => {
                let parsed = serde_json::from_str(&json)
                    .map_err(|e| AppError::Cache(format!("failed to parse cached value: {e}")))?;
                debug!(key, "Cache hit");
                Ok(Some(parsed))
            }
            None => {
                debug!(key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Set a value with a TTL
    pub async fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| AppError::Cache(format!("failed to serialize value: {e}")))?;

        let mut conn = self.connection.write().await;
        conn.set_ex::<_, _, ()>(key, json, ttl_secs)
            .await
            .map_err(|e| AppError::Cache(format!("failed to set key '{key}': {e}")))?;

        debug!(key, ttl_secs, "Cache set");
        Ok(())
    }

    /// Delete a key, returning whether it existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.write().await;

        let deleted: i32 = conn
            .del(key)
            .await
            .map_err(|e| AppError::Cache(format!("failed to delete key '{key}': {e}")))?;

        Ok(deleted > 0)
    }

    /// Ping redis to check connectivity
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.write().await;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| AppError::Cache(format!("redis ping failed: {e}")))?;
        Ok(())
    }
}

/// Stable fingerprint of a text, used only as a cache key
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cache key builders
pub mod keys {
    /// Key for an in-flight conversation body
    pub fn conversation(conversation_id: &str) -> String {
        format!("conversation:{conversation_id}")
    }

    /// Key for a cached embedding vector
    pub fn embedding(text_fingerprint: &str) -> String {
        format!("embedding:{text_fingerprint}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_builders() {
        let id = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(keys::conversation(id), format!("conversation:{id}"));
        assert!(keys::embedding("abc123").starts_with("embedding:"));
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        assert_eq!(fingerprint("hello"), fingerprint("hello"));
        assert_ne!(fingerprint("hello"), fingerprint("world"));
        // sha256 hex
        assert_eq!(fingerprint("hello").len(), 64);
    }
}
