//! Delivery-attempt deduplication.
//!
//! Each dequeued attempt is checked and marked in one atomic round trip before any
//! transport is touched. The mark is set on first sight, whatever the attempt's
//! outcome turns out to be.
//!
//! Keys are scoped to one attempt, `idempotency:{request_id}:{retry_count}`:
//! - a broker redelivery of the same attempt (crash before ack, duplicate publish)
//!   finds the mark and is skipped
//! - the pipeline's own re-publish carries `retry_count + 1` and is a new attempt
//!
//! The flip side: a producer that publishes the same `request_id` twice with different
//! `retry_count` values gets both past dedup, since each is a distinct attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::time::Instant;

use courier_common::types::DeliveryRequest;

/// Default retention of a dedup marker (24 hours).
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const KEY_PREFIX: &str = "idempotency";

#[derive(Debug, Error)]
pub enum DedupStoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("dedup store unavailable")]
    Unavailable,
}

/// Store key for one delivery attempt.
pub fn attempt_key(request: &DeliveryRequest) -> String {
    format!(
        "{KEY_PREFIX}:{}:{}",
        request.request_id, request.retry_count
    )
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically mark `key`.
    ///
    /// Returns `true` if it was already marked (skip the attempt), `false` if this
    /// call set the mark. An existing mark's TTL is left alone.
    async fn check_and_mark(&self, key: &str) -> Result<bool, DedupStoreError>;

    /// Remove the mark for an attempt that was handed back to the broker unfinished.
    async fn release(&self, key: &str) -> Result<(), DedupStoreError>;
}

/// Redis-backed store using `SET key 1 NX EX ttl`.
pub struct RedisDedupStore {
    redis: ConnectionManager,
    ttl: Duration,
}

impl RedisDedupStore {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn check_and_mark(&self, key: &str) -> Result<bool, DedupStoreError> {
        let mut conn = self.redis.clone();

        // Some("OK") when the key was set, None when it already existed
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        let duplicate = result.is_none();
        if duplicate {
            tracing::debug!(key, "Dedup marker already present");
        }
        Ok(duplicate)
    }

    async fn release(&self, key: &str) -> Result<(), DedupStoreError> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-process store with the same semantics, for tests and single-node use.
#[derive(Debug)]
pub struct MemoryDedupStore {
    ttl: Duration,
    marks: Mutex<HashMap<String, Instant>>,
    unavailable: AtomicBool,
}

impl MemoryDedupStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            marks: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with `DedupStoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_marked(&self, key: &str) -> bool {
        self.marks
            .lock()
            .get(key)
            .is_some_and(|expires_at| *expires_at > Instant::now())
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn check_and_mark(&self, key: &str) -> Result<bool, DedupStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DedupStoreError::Unavailable);
        }

        let now = Instant::now();
        let mut marks = self.marks.lock();
        match marks.get(key) {
            Some(expires_at) if *expires_at > now => Ok(true),
            _ => {
                marks.insert(key.to_string(), now + self.ttl);
                Ok(false)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), DedupStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DedupStoreError::Unavailable);
        }
        self.marks.lock().remove(key);
        Ok(())
    }
}
