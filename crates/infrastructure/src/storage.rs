use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{staging_prefix, ObjectStore};
use tokio::sync::RwLock;
use tracing::debug;

/// 内存暂存桶
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    buckets: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_file(&self, bucket: &str, billing_account_id: &str, timestamp: i64, name: &str) {
        let path = format!("{}{}", staging_prefix(billing_account_id, timestamp), name);
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default()
            .insert(path);
    }

    pub async fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.read().await.contains_key(bucket)
    }

    pub async fn file_count(&self, bucket: &str) -> usize {
        self.buckets
            .read()
            .await
            .get(bucket)
            .map(BTreeSet::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> PipelineResult<()> {
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_prefix(
        &self,
        bucket: &str,
        billing_account_id: &str,
        timestamp: i64,
    ) -> PipelineResult<usize> {
        let prefix = staging_prefix(billing_account_id, timestamp);
        let mut buckets = self.buckets.write().await;
        let files = buckets
            .get_mut(bucket)
            .ok_or_else(|| PipelineError::Storage(format!("存储桶不存在: {bucket}")))?;
        let before = files.len();
        files.retain(|path| !path.starts_with(&prefix));
        let deleted = before - files.len();
        debug!("从 {} 删除 {} 个暂存文件 ({})", bucket, deleted, prefix);
        Ok(deleted)
    }

    async fn exists(
        &self,
        bucket: &str,
        billing_account_id: &str,
        timestamp: i64,
    ) -> PipelineResult<bool> {
        let prefix = staging_prefix(billing_account_id, timestamp);
        Ok(self
            .buckets
            .read()
            .await
            .get(bucket)
            .is_some_and(|files| files.iter().any(|path| path.starts_with(&prefix))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_by_account_and_timestamp() {
        let store = InMemoryObjectStore::new();
        store.ensure_bucket("b").await.unwrap();
        store.put_file("b", "acc-1", 100, "a.json").await;
        store.put_file("b", "acc-1", 100, "b.json").await;
        store.put_file("b", "acc-1", 200, "a.json").await;

        assert_eq!(store.delete_prefix("b", "acc-1", 100).await.unwrap(), 2);
        assert!(!store.exists("b", "acc-1", 100).await.unwrap());
        assert!(store.exists("b", "acc-1", 200).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_bucket_is_storage_error() {
        let store = InMemoryObjectStore::new();
        assert!(matches!(
            store.delete_prefix("none", "acc-1", 1).await,
            Err(PipelineError::Storage(_))
        ));
    }
}
