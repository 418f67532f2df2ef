use std::sync::Arc;

use billing_core::AppConfig;

use crate::{
    BillingEvents, BillingTables, MetadataStore, NotificationSink, ObjectStore, TaskQueue,
    WarehouseJobs,
};

/// 流水线运行所需的全部外部协作者
#[derive(Clone)]
pub struct PipelineContext {
    pub store: MetadataStore,
    pub warehouse: Arc<dyn WarehouseJobs>,
    pub tables: Arc<dyn BillingTables>,
    pub queue: Arc<dyn TaskQueue>,
    pub bucket: Arc<dyn ObjectStore>,
    pub notifier: Arc<dyn NotificationSink>,
    pub events: Arc<dyn BillingEvents>,
    pub config: Arc<AppConfig>,
}

impl PipelineContext {
    pub fn is_master(&self, billing_account_id: &str) -> bool {
        billing_account_id == self.config.internal_manager.master_account_id
    }
}
