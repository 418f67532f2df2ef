use std::sync::Arc;
use std::time::Duration;

use billing_core::models::{
    BillingTableInfo, BucketData, CopyHistory, CopyHistoryStatus, ExternalTaskJobs,
    ExternalTaskMetadata, ExternalTaskState, InternalTaskJobs, InternalTaskMetadata,
    InternalTaskState, Job, JobStatus, LifecycleStage, Segment,
};
use billing_core::AppConfig;
use billing_domain::{
    bucket_name, paths, JobKind, PipelineContext, StageRequest, TaskQueue, TaskRequest,
    Transactor, PIPELINE_LOCATION,
};
use billing_infrastructure::{
    InMemoryBillingEvents, InMemoryBillingTables, InMemoryMetadata, InMemoryObjectStore,
    InMemoryTaskQueue, InMemoryWarehouse, RecordingNotificationSink,
};
use billing_worker::{QueueConsumer, StageHandler, StageOutcome, StageWorker};
use chrono::{DateTime, Utc};

const ACCOUNT: &str = "AAA-111";

struct Fixture {
    ctx: PipelineContext,
    warehouse: Arc<InMemoryWarehouse>,
    queue: Arc<InMemoryTaskQueue>,
}

fn fixture() -> Fixture {
    let metadata = InMemoryMetadata::new(5);
    let tables = Arc::new(InMemoryBillingTables::new());
    let bucket = Arc::new(InMemoryObjectStore::new());
    let warehouse = Arc::new(
        InMemoryWarehouse::new()
            .with_tables(tables.clone())
            .with_bucket(bucket.clone()),
    );
    let queue = Arc::new(InMemoryTaskQueue::new());
    let ctx = PipelineContext {
        store: metadata.store(),
        warehouse: warehouse.clone(),
        tables,
        queue: queue.clone(),
        bucket,
        notifier: Arc::new(RecordingNotificationSink::new()),
        events: Arc::new(InMemoryBillingEvents::new()),
        config: Arc::new(AppConfig::default()),
    };
    Fixture {
        ctx,
        warehouse,
        queue,
    }
}

fn at(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn segment() -> Segment {
    Segment::new(at("2024-02-01T00:00:00Z"), at("2024-02-02T00:00:00Z"))
}

fn armed() -> Job {
    Job::armed(
        Utc::now(),
        chrono::Duration::minutes(10),
        chrono::Duration::minutes(50),
    )
}

fn internal_task(account: &str, state: InternalTaskState, iteration: i64) -> InternalTaskMetadata {
    InternalTaskMetadata {
        billing_account_id: account.to_string(),
        customer_id: "customer-1".to_string(),
        state,
        iteration,
        ttl: None,
        jobs: InternalTaskJobs {
            from_local_to_tmp: Some(armed()),
            ..Default::default()
        },
        segment: Some(segment()),
        copy_history: CopyHistory {
            target_time: at("2024-01-01T00:00:00Z"),
            status: CopyHistoryStatus::Done,
        },
        lifecycle_stage: LifecycleStage::Active,
        dummy: false,
        onboarding: false,
        oldest_partition: None,
        last_update: None,
    }
}

fn external_task(state: ExternalTaskState, iteration: i64) -> ExternalTaskMetadata {
    ExternalTaskMetadata {
        billing_account_id: ACCOUNT.to_string(),
        customer_id: "customer-1".to_string(),
        state,
        iteration,
        jobs: ExternalTaskJobs::default(),
        segment: Some(segment()),
        bucket: BucketData::cleared(bucket_name(ACCOUNT)),
        onboarding: false,
        lifecycle_stage: LifecycleStage::Active,
        source_table: BillingTableInfo {
            project_id: "customer-project".to_string(),
            dataset_id: "billing".to_string(),
            table_id: "export_v1".to_string(),
            location: "EU".to_string(),
        },
        last_update: None,
    }
}

fn request(iteration: i64) -> StageRequest {
    StageRequest {
        billing_account_id: ACCOUNT.to_string(),
        iteration,
    }
}

#[tokio::test]
async fn test_internal_request_submits_copy_job() {
    let fx = fixture();
    fx.ctx
        .store
        .internal_tasks
        .set(ACCOUNT, internal_task(ACCOUNT, InternalTaskState::Pending, 4))
        .await
        .unwrap();
    let worker = StageWorker::new(fx.ctx.clone());

    let outcome = worker
        .handle(paths::INTERNAL_TASK, &request(4))
        .await
        .unwrap();

    let StageOutcome::Submitted { job_id } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert!(job_id.starts_with("int-local-to-tmp-AAA-111-4-"));

    let task = fx.ctx.store.internal_tasks.get(ACCOUNT).await.unwrap();
    assert_eq!(task.state, InternalTaskState::Running);
    let job = task.jobs.from_local_to_tmp.unwrap();
    assert_eq!(job.job_id.as_deref(), Some(job_id.as_str()));
    assert_eq!(job.status, JobStatus::Created);

    let jobs = fx.warehouse.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].spec.location, PIPELINE_LOCATION);
    assert!(matches!(
        &jobs[0].spec.kind,
        JobKind::CopyLocalToTmp { segment: s, .. } if *s == segment()
    ));
}

#[tokio::test]
async fn test_redelivered_request_is_skipped() {
    let fx = fixture();
    fx.ctx
        .store
        .internal_tasks
        .set(ACCOUNT, internal_task(ACCOUNT, InternalTaskState::Pending, 4))
        .await
        .unwrap();
    let worker = StageWorker::new(fx.ctx.clone());

    worker.run_internal(&request(4)).await.unwrap();
    let outcome = worker.run_internal(&request(4)).await.unwrap();

    assert_eq!(
        outcome,
        StageOutcome::Skipped {
            state: InternalTaskState::Running.to_string()
        }
    );
    assert_eq!(fx.warehouse.jobs().await.len(), 1);
}

#[tokio::test]
async fn test_request_from_old_iteration_is_rejected() {
    let fx = fixture();
    fx.ctx
        .store
        .internal_tasks
        .set(ACCOUNT, internal_task(ACCOUNT, InternalTaskState::Pending, 5))
        .await
        .unwrap();
    let worker = StageWorker::new(fx.ctx.clone());

    let err = worker.run_internal(&request(4)).await.unwrap_err();

    assert!(err.is_stale_iteration());
    let task = fx.ctx.store.internal_tasks.get(ACCOUNT).await.unwrap();
    assert_eq!(task.state, InternalTaskState::Pending);
    assert!(fx.warehouse.jobs().await.is_empty());
}

#[tokio::test]
async fn test_export_records_staging_location_before_submitting() {
    let fx = fixture();
    let mut task = external_task(ExternalTaskState::WaitingForToBucket, 2);
    task.jobs.to_bucket = Some(armed());
    fx.ctx
        .store
        .external_tasks
        .set(ACCOUNT, task)
        .await
        .unwrap();
    let worker = StageWorker::new(fx.ctx.clone());

    let outcome = worker
        .handle(paths::EXTERNAL_TO_BUCKET, &request(2))
        .await
        .unwrap();
    assert!(matches!(outcome, StageOutcome::Submitted { .. }));

    let task = fx.ctx.store.external_tasks.get(ACCOUNT).await.unwrap();
    assert_eq!(task.state, ExternalTaskState::ToTaskScheduled);
    let timestamp = task.bucket.last_write_timestamp.unwrap();
    assert_eq!(task.bucket.bucket_name, bucket_name(ACCOUNT));
    assert!(task
        .bucket
        .file_uri
        .as_deref()
        .unwrap()
        .contains(&timestamp.to_string()));
    assert!(task.jobs.to_bucket.unwrap().has_id());

    let jobs = fx.warehouse.jobs().await;
    assert_eq!(jobs[0].spec.location, "EU");
    assert!(jobs[0].spec.job_prefix.starts_with("ext-to-bucket-AAA-111-2-"));
}

#[tokio::test]
async fn test_import_reads_from_recorded_staging_files() {
    let fx = fixture();
    let mut task = external_task(ExternalTaskState::WaitingForFromBucket, 3);
    task.bucket.last_write_timestamp = Some(1_717_200_000);
    task.jobs.from_bucket = Some(armed());
    fx.ctx
        .store
        .external_tasks
        .set(ACCOUNT, task)
        .await
        .unwrap();
    let worker = StageWorker::new(fx.ctx.clone());

    worker
        .handle(paths::EXTERNAL_FROM_BUCKET, &request(3))
        .await
        .unwrap();

    let task = fx.ctx.store.external_tasks.get(ACCOUNT).await.unwrap();
    assert_eq!(task.state, ExternalTaskState::FromTaskScheduled);
    let jobs = fx.warehouse.jobs().await;
    assert_eq!(jobs[0].spec.location, PIPELINE_LOCATION);
    assert!(matches!(
        &jobs[0].spec.kind,
        JobKind::LoadFromBucket { timestamp: 1_717_200_000, .. }
    ));
}

#[tokio::test]
async fn test_failed_submission_leaves_task_scheduled_without_job() {
    let fx = fixture();
    let mut task = external_task(ExternalTaskState::WaitingForToBucket, 2);
    task.jobs.to_bucket = Some(armed());
    fx.ctx
        .store
        .external_tasks
        .set(ACCOUNT, task)
        .await
        .unwrap();
    fx.warehouse.set_run_fails(true);
    let worker = StageWorker::new(fx.ctx.clone());

    assert!(worker
        .handle(paths::EXTERNAL_TO_BUCKET, &request(2))
        .await
        .is_err());

    let task = fx.ctx.store.external_tasks.get(ACCOUNT).await.unwrap();
    assert_eq!(task.state, ExternalTaskState::ToTaskScheduled);
    assert!(!task.jobs.to_bucket.unwrap().has_id());
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let fx = fixture();
    let worker = StageWorker::new(fx.ctx.clone());

    let err = worker
        .handle("/tasks/unknown", &request(1))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_consumer_drives_worker_from_queue() {
    let fx = fixture();
    for account in ["AAA-111", "BBB-222"] {
        fx.ctx
            .store
            .internal_tasks
            .set(account, internal_task(account, InternalTaskState::Pending, 1))
            .await
            .unwrap();
        let body = serde_json::to_value(StageRequest {
            billing_account_id: account.to_string(),
            iteration: 1,
        })
        .unwrap();
        fx.queue
            .enqueue(TaskRequest::post(
                &fx.ctx.config.queues.internal_tasks,
                paths::INTERNAL_TASK,
                body,
            ))
            .await
            .unwrap();
    }
    let consumer = QueueConsumer::new(
        "worker-test",
        fx.queue.clone(),
        Arc::new(StageWorker::new(fx.ctx.clone())),
        vec![fx.ctx.config.queues.internal_tasks.clone()],
        Duration::from_millis(10),
    );

    assert_eq!(consumer.drain_once().await.unwrap(), 2);
    assert_eq!(consumer.drain_once().await.unwrap(), 0);

    for account in ["AAA-111", "BBB-222"] {
        let task = fx.ctx.store.internal_tasks.get(account).await.unwrap();
        assert_eq!(task.state, InternalTaskState::Running);
    }
    assert_eq!(fx.warehouse.jobs().await.len(), 2);
}
