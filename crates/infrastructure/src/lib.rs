//! 各个端口的内存实现, 供嵌入式运行和测试使用

pub mod document_store;
pub mod events;
pub mod in_memory_queue;
pub mod notification;
pub mod storage;
pub mod tables;
pub mod warehouse;

use std::sync::Arc;

use billing_core::models::{
    ExternalTaskMetadata, InternalTaskMetadata, ManagerMetadata, ReconciliationCheckpoint,
};
use billing_domain::MetadataStore;

pub use document_store::InMemoryDocumentStore;
pub use events::InMemoryBillingEvents;
pub use in_memory_queue::{InMemoryTaskQueue, QueueStats};
pub use notification::RecordingNotificationSink;
pub use storage::InMemoryObjectStore;
pub use tables::InMemoryBillingTables;
pub use warehouse::{InMemoryWarehouse, RecordedJob, ScriptedOutcome};

/// 内存元数据存储的各个集合
#[derive(Debug, Clone)]
pub struct InMemoryMetadata {
    pub external_tasks: Arc<InMemoryDocumentStore<ExternalTaskMetadata>>,
    pub internal_tasks: Arc<InMemoryDocumentStore<InternalTaskMetadata>>,
    pub managers: Arc<InMemoryDocumentStore<ManagerMetadata>>,
    pub checkpoints: Arc<InMemoryDocumentStore<ReconciliationCheckpoint>>,
}

impl InMemoryMetadata {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            external_tasks: Arc::new(InMemoryDocumentStore::with_max_attempts(
                "externalTasks",
                max_attempts,
            )),
            internal_tasks: Arc::new(InMemoryDocumentStore::with_max_attempts(
                "internalTasks",
                max_attempts,
            )),
            managers: Arc::new(InMemoryDocumentStore::with_max_attempts(
                "managers",
                max_attempts,
            )),
            checkpoints: Arc::new(InMemoryDocumentStore::with_max_attempts(
                "reconciliationCheckpoints",
                max_attempts,
            )),
        }
    }

    pub fn store(&self) -> MetadataStore {
        MetadataStore {
            external_tasks: self.external_tasks.clone(),
            internal_tasks: self.internal_tasks.clone(),
            managers: self.managers.clone(),
            checkpoints: self.checkpoints.clone(),
        }
    }
}
