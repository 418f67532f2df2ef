use std::sync::Arc;

use async_trait::async_trait;
use billing_core::models::{
    Document, ExternalTaskMetadata, InternalTaskMetadata, ManagerMetadata,
    ReconciliationCheckpoint,
};
use billing_core::PipelineResult;

/// 事务中执行的纯更新函数, 冲突重试时可能被调用多次
pub type UpdateFn<'a, T> = &'a (dyn Fn(T) -> PipelineResult<T> + Send + Sync);

/// 单类文档的事务存储
///
/// `apply` 读取当前文档, 执行更新函数, 再写回; 写回时版本变化则重试。
/// 更新函数返回错误时不产生任何写入。
#[async_trait]
pub trait Transactor<T: Document>: Send + Sync {
    async fn get(&self, key: &str) -> PipelineResult<T>;

    async fn list(&self) -> PipelineResult<Vec<(String, T)>>;

    async fn create(&self, key: &str, doc: T) -> PipelineResult<()>;

    /// 覆盖写入, 文档不存在时创建
    async fn set(&self, key: &str, doc: T) -> PipelineResult<()>;

    async fn apply(&self, key: &str, update: UpdateFn<'_, T>) -> PipelineResult<T>;

    async fn delete(&self, key: &str) -> PipelineResult<()>;

    async fn find(&self, key: &str) -> PipelineResult<Option<T>> {
        match self.get(key).await {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// 管理器单例
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerKind {
    Internal,
    External,
}

impl ManagerKind {
    pub fn key(&self) -> &'static str {
        match self {
            ManagerKind::Internal => "internal",
            ManagerKind::External => "external",
        }
    }
}

impl std::fmt::Display for ManagerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// 元数据存储的固定布局
#[derive(Clone)]
pub struct MetadataStore {
    pub external_tasks: Arc<dyn Transactor<ExternalTaskMetadata>>,
    pub internal_tasks: Arc<dyn Transactor<InternalTaskMetadata>>,
    pub managers: Arc<dyn Transactor<ManagerMetadata>>,
    pub checkpoints: Arc<dyn Transactor<ReconciliationCheckpoint>>,
}

impl MetadataStore {
    pub async fn manager(&self, kind: ManagerKind) -> PipelineResult<ManagerMetadata> {
        self.managers.get(kind.key()).await
    }
}
