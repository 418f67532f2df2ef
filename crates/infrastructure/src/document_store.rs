use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use billing_core::models::Document;
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{Transactor, UpdateFn};
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone)]
struct Versioned<T> {
    version: u64,
    doc: T,
}

/// 内存事务文档存储
///
/// 每个文档带版本号, `apply` 在写回时比较版本, 不一致则重新读取并重试。
#[derive(Debug)]
pub struct InMemoryDocumentStore<T> {
    collection: &'static str,
    docs: Arc<RwLock<HashMap<String, Versioned<T>>>>,
    max_attempts: u32,
}

impl<T: Document> InMemoryDocumentStore<T> {
    pub fn new(collection: &'static str) -> Self {
        Self::with_max_attempts(collection, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(collection: &'static str, max_attempts: u32) -> Self {
        Self {
            collection,
            docs: Arc::new(RwLock::new(HashMap::new())),
            max_attempts: max_attempts.max(1),
        }
    }

    fn doc_key(&self, key: &str) -> String {
        format!("{}/{}", self.collection, key)
    }

    pub async fn version(&self, key: &str) -> Option<u64> {
        self.docs.read().await.get(key).map(|v| v.version)
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

#[async_trait]
impl<T: Document> Transactor<T> for InMemoryDocumentStore<T> {
    async fn get(&self, key: &str) -> PipelineResult<T> {
        self.docs
            .read()
            .await
            .get(key)
            .map(|v| v.doc.clone())
            .ok_or_else(|| PipelineError::not_found(self.doc_key(key)))
    }

    async fn list(&self) -> PipelineResult<Vec<(String, T)>> {
        let docs = self.docs.read().await;
        let mut entries: Vec<_> = docs
            .iter()
            .map(|(key, v)| (key.clone(), v.doc.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn create(&self, key: &str, mut doc: T) -> PipelineResult<()> {
        let mut docs = self.docs.write().await;
        if docs.contains_key(key) {
            return Err(PipelineError::AlreadyExists {
                key: self.doc_key(key),
            });
        }
        doc.set_last_update(Utc::now());
        docs.insert(key.to_string(), Versioned { version: 1, doc });
        Ok(())
    }

    async fn set(&self, key: &str, mut doc: T) -> PipelineResult<()> {
        doc.set_last_update(Utc::now());
        let mut docs = self.docs.write().await;
        let version = docs.get(key).map(|v| v.version + 1).unwrap_or(1);
        docs.insert(key.to_string(), Versioned { version, doc });
        Ok(())
    }

    async fn apply(&self, key: &str, update: UpdateFn<'_, T>) -> PipelineResult<T> {
        for attempt in 1..=self.max_attempts {
            let current = {
                let docs = self.docs.read().await;
                docs.get(key)
                    .cloned()
                    .ok_or_else(|| PipelineError::not_found(self.doc_key(key)))?
            };

            let mut next = update(current.doc)?;
            next.set_last_update(Utc::now());

            let mut docs = self.docs.write().await;
            match docs.get_mut(key) {
                Some(stored) if stored.version == current.version => {
                    stored.version += 1;
                    stored.doc = next.clone();
                    return Ok(next);
                }
                Some(_) => {
                    debug!("文档 {} 写入冲突, 第 {} 次重试", self.doc_key(key), attempt);
                }
                None => return Err(PipelineError::not_found(self.doc_key(key))),
            }
            drop(docs);
            tokio::task::yield_now().await;
        }

        warn!("文档 {} 事务冲突次数超过上限", self.doc_key(key));
        Err(PipelineError::TransactionConflict {
            key: self.doc_key(key),
            attempts: self.max_attempts,
        })
    }

    async fn delete(&self, key: &str) -> PipelineResult<()> {
        self.docs.write().await.remove(key);
        Ok(())
    }
}
