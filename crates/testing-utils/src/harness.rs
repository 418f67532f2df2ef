//! 内存流水线
//!
//! 所有端口都接到内存实现上, 仓库作业完成时真实地搬运内存账单表中的数据行。

use std::sync::Arc;
use std::time::Duration;

use billing_core::models::{ExternalTaskMetadata, InternalTaskMetadata, ManagerMetadata};
use billing_core::{AppConfig, PipelineResult};
use billing_domain::{ManagerKind, PipelineContext, Transactor};
use billing_infrastructure::{
    InMemoryBillingEvents, InMemoryBillingTables, InMemoryMetadata, InMemoryObjectStore,
    InMemoryTaskQueue, InMemoryWarehouse, RecordingNotificationSink,
};
use billing_worker::{QueueConsumer, StageWorker};

use crate::helpers::test_config;

pub struct TestHarness {
    pub metadata: InMemoryMetadata,
    pub warehouse: Arc<InMemoryWarehouse>,
    pub tables: Arc<InMemoryBillingTables>,
    pub bucket: Arc<InMemoryObjectStore>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub notifier: Arc<RecordingNotificationSink>,
    pub events: Arc<InMemoryBillingEvents>,
    pub ctx: PipelineContext,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let metadata = InMemoryMetadata::new(config.metadata.transaction_max_attempts);
        let tables = Arc::new(InMemoryBillingTables::new());
        let bucket = Arc::new(InMemoryObjectStore::new());
        let warehouse = Arc::new(
            InMemoryWarehouse::new()
                .with_tables(tables.clone())
                .with_bucket(bucket.clone()),
        );
        let queue = Arc::new(InMemoryTaskQueue::new());
        let notifier = Arc::new(RecordingNotificationSink::new());
        let events = Arc::new(InMemoryBillingEvents::new());

        let ctx = PipelineContext {
            store: metadata.store(),
            warehouse: warehouse.clone(),
            tables: tables.clone(),
            queue: queue.clone(),
            bucket: bucket.clone(),
            notifier: notifier.clone(),
            events: events.clone(),
            config: Arc::new(config),
        };

        Self {
            metadata,
            warehouse,
            tables,
            bucket,
            queue,
            notifier,
            events,
            ctx,
        }
    }

    pub fn context(&self) -> PipelineContext {
        self.ctx.clone()
    }

    pub fn stage_worker(&self) -> StageWorker {
        StageWorker::new(self.ctx.clone())
    }

    /// 消费两个阶段队列的消费者, 尚未启动
    pub fn consumer(&self) -> QueueConsumer {
        QueueConsumer::new(
            "test-consumer",
            self.queue.clone(),
            Arc::new(self.stage_worker()),
            vec![
                self.ctx.config.queues.internal_tasks.clone(),
                self.ctx.config.queues.external_tasks.clone(),
            ],
            Duration::from_millis(50),
        )
    }

    /// 在后台持续处理阶段请求, 返回的消费者释放前需要调用 `stop`
    pub async fn start_workers(&self) -> PipelineResult<QueueConsumer> {
        let consumer = self.consumer();
        consumer.start().await?;
        Ok(consumer)
    }

    /// 同步处理队列中现有的阶段请求
    pub async fn run_workers(&self) -> PipelineResult<usize> {
        self.consumer().drain_once().await
    }

    pub async fn seed_external(&self, task: ExternalTaskMetadata) -> PipelineResult<()> {
        let key = task.billing_account_id.clone();
        self.ctx.store.external_tasks.set(&key, task).await
    }

    pub async fn seed_internal(&self, task: InternalTaskMetadata) -> PipelineResult<()> {
        let key = task.billing_account_id.clone();
        self.ctx.store.internal_tasks.set(&key, task).await
    }

    pub async fn seed_manager(
        &self,
        kind: ManagerKind,
        manager: ManagerMetadata,
    ) -> PipelineResult<()> {
        self.ctx.store.managers.set(kind.key(), manager).await
    }

    pub async fn external_task(&self, account: &str) -> PipelineResult<ExternalTaskMetadata> {
        self.ctx.store.external_tasks.get(account).await
    }

    pub async fn internal_task(&self, account: &str) -> PipelineResult<InternalTaskMetadata> {
        self.ctx.store.internal_tasks.get(account).await
    }

    pub async fn manager(&self, kind: ManagerKind) -> PipelineResult<ManagerMetadata> {
        self.ctx.store.manager(kind).await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{ExternalTaskBuilder, InternalTaskBuilder};
    use crate::helpers::at;
    use billing_core::models::{ExternalTaskState, InternalTaskState, Job, JobStatus};
    use billing_domain::{paths, StageRequest, TaskQueue, TaskRequest};
    use chrono::Utc;

    #[tokio::test]
    async fn test_workers_pick_up_dispatched_requests() {
        let harness = TestHarness::new();
        harness
            .seed_internal(
                InternalTaskBuilder::new("AAA-111")
                    .with_state(InternalTaskState::Pending)
                    .with_iteration(3)
                    .with_segment(at("2024-01-01T00:00:00Z"), at("2024-01-02T00:00:00Z"))
                    .with_copy_job(Job::armed(
                        Utc::now(),
                        chrono::Duration::minutes(10),
                        chrono::Duration::minutes(50),
                    ))
                    .build(),
            )
            .await
            .unwrap();
        harness
            .seed_external(
                ExternalTaskBuilder::new("AAA-111")
                    .with_state(ExternalTaskState::Pending)
                    .build(),
            )
            .await
            .unwrap();

        let body = serde_json_body("AAA-111", 3);
        harness
            .queue
            .enqueue(TaskRequest::post(
                &harness.ctx.config.queues.internal_tasks,
                paths::INTERNAL_TASK,
                body,
            ))
            .await
            .unwrap();

        assert_eq!(harness.run_workers().await.unwrap(), 1);
        let task = harness.internal_task("AAA-111").await.unwrap();
        assert_eq!(task.state, InternalTaskState::Running);
        let job = task.jobs.from_local_to_tmp.unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert!(job.job_id.unwrap().starts_with("int-local-to-tmp-AAA-111-3-"));
    }

    fn serde_json_body(account: &str, iteration: i64) -> serde_json::Value {
        serde_json::to_value(StageRequest {
            billing_account_id: account.to_string(),
            iteration,
        })
        .unwrap()
    }
}
