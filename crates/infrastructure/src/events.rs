use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{BillingEvent, BillingEvents, ImportStatus};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Default)]
pub struct InMemoryBillingEvents {
    published: RwLock<Vec<BillingEvent>>,
    import_statuses: RwLock<HashMap<String, ImportStatus>>,
    fails: AtomicBool,
}

impl InMemoryBillingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<BillingEvent> {
        self.published.read().await.clone()
    }

    /// 之后的写操作都返回错误
    pub fn set_fails(&self, fails: bool) {
        self.fails.store(fails, Ordering::SeqCst);
    }

    fn check_writable(&self) -> PipelineResult<()> {
        if self.fails.load(Ordering::SeqCst) {
            return Err(PipelineError::internal("事件服务不可用"));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingEvents for InMemoryBillingEvents {
    async fn publish(&self, event: &BillingEvent) -> PipelineResult<()> {
        self.check_writable()?;
        info!("发布账单事件: {:?}", event);
        self.published.write().await.push(event.clone());
        Ok(())
    }

    async fn import_status(&self, billing_account_id: &str) -> PipelineResult<ImportStatus> {
        Ok(self
            .import_statuses
            .read()
            .await
            .get(billing_account_id)
            .copied()
            .unwrap_or_default())
    }

    async fn set_import_status(
        &self,
        billing_account_id: &str,
        status: ImportStatus,
    ) -> PipelineResult<()> {
        self.check_writable()?;
        self.import_statuses
            .write()
            .await
            .insert(billing_account_id.to_string(), status);
        Ok(())
    }
}
