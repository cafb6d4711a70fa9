use crate::storage::{CacheEngine, CasOutcome};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// A replica the cluster client can write to and read from.
///
/// `Err` always means the replica could not be reached or did not answer in time;
/// a definite "no" (rejected admission, stale CAS token) is `Ok(false)`.
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> &str;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Value plus the CAS token the replica currently holds for it.
    async fn get_with_token(&self, key: &str) -> Result<Option<(Bytes, u64)>>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        expected: u64,
        ttl: Duration,
    ) -> Result<bool>;

    async fn clear(&self) -> Result<()>;
}

/// The replica living in this process.
pub struct LocalNode {
    id: String,
    engine: Arc<CacheEngine>,
}

impl LocalNode {
    pub fn new(id: impl Into<String>, engine: Arc<CacheEngine>) -> Self {
        Self {
            id: id.into(),
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }
}

#[async_trait]
impl Node for LocalNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        Ok(self.engine.set(key, value, ttl))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.engine.get(key))
    }

    async fn get_with_token(&self, key: &str) -> Result<Option<(Bytes, u64)>> {
        Ok(self.engine.get_with_token(key))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.engine.delete(key))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        expected: u64,
        ttl: Duration,
    ) -> Result<bool> {
        let outcome = self.engine.compare_and_swap(key, value, expected, ttl);
        Ok(matches!(outcome, CasOutcome::Stored(_)))
    }

    async fn clear(&self) -> Result<()> {
        self.engine.clear();
        Ok(())
    }
}
