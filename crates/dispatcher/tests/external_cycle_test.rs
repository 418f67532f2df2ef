use billing_core::models::{
    ExternalTaskState, Job, JobStatus, LifecycleStage, ManagerState, Segment,
};
use billing_core::PipelineError;
use billing_dispatcher::ExternalManager;
use billing_domain::{bucket_name, BillingCopy, BillingTables, ManagerKind};
use billing_testing_utils::{at, ExternalTaskBuilder, ManagerMetadataBuilder, TestHarness};
use chrono::{Duration, Utc};

const ACCOUNT: &str = "AAA-111";

/// 跑一个外部周期, 然后让阶段工作器处理分发出来的请求
async fn cycle_then_workers(harness: &TestHarness, manager: &ExternalManager) -> ExternalTaskState {
    manager.run_cycle().await.unwrap();
    harness.run_workers().await.unwrap();
    harness.external_task(ACCOUNT).await.unwrap().state
}

#[tokio::test]
async fn test_account_moves_through_both_stages() {
    let harness = TestHarness::new();
    harness
        .seed_external(ExternalTaskBuilder::new(ACCOUNT).build())
        .await
        .unwrap();
    let rows = vec![
        at("2024-03-01T10:00:00Z"),
        at("2024-03-02T11:00:00Z"),
        at("2024-03-03T12:00:00Z"),
    ];
    harness
        .tables
        .insert_rows(BillingCopy::Source, ACCOUNT, rows.clone())
        .await;
    let manager = ExternalManager::new(harness.context());

    let report = manager.run_cycle().await.unwrap();
    assert_eq!(report.iteration, 1);
    assert_eq!(report.dispatched, 1);
    let task = harness.external_task(ACCOUNT).await.unwrap();
    assert_eq!(task.state, ExternalTaskState::WaitingForToBucket);
    assert_eq!(task.iteration, 1);
    assert_eq!(
        task.segment,
        Some(Segment::new(
            at("2024-03-01T09:59:59Z"),
            at("2024-03-03T12:00:00Z")
        ))
    );

    assert_eq!(harness.run_workers().await.unwrap(), 1);
    let task = harness.external_task(ACCOUNT).await.unwrap();
    assert_eq!(task.state, ExternalTaskState::ToTaskScheduled);
    assert!(task.jobs.to_bucket.as_ref().unwrap().has_id());
    assert!(task.bucket.last_write_timestamp.is_some());

    assert_eq!(
        cycle_then_workers(&harness, &manager).await,
        ExternalTaskState::ToBucket
    );
    // 导出完成后立即分发导入
    assert_eq!(
        cycle_then_workers(&harness, &manager).await,
        ExternalTaskState::FromTaskScheduled
    );
    assert_eq!(
        cycle_then_workers(&harness, &manager).await,
        ExternalTaskState::FromBucket
    );
    assert_eq!(
        cycle_then_workers(&harness, &manager).await,
        ExternalTaskState::Pending
    );

    let task = harness.external_task(ACCOUNT).await.unwrap();
    assert!(task.jobs.both_done());
    assert_eq!(harness.tables.rows(BillingCopy::Local, ACCOUNT).await, rows);

    let manager_doc = harness.manager(ManagerKind::External).await.unwrap();
    assert_eq!(manager_doc.state, ManagerState::Done);
    assert_eq!(manager_doc.iteration, 5);
}

#[tokio::test]
async fn test_next_round_purges_previous_staging_files() {
    let harness = TestHarness::new();
    harness
        .seed_external(ExternalTaskBuilder::new(ACCOUNT).build())
        .await
        .unwrap();
    harness
        .tables
        .insert_rows(BillingCopy::Source, ACCOUNT, [at("2024-03-01T10:00:00Z")])
        .await;
    let manager = ExternalManager::new(harness.context());
    for _ in 0..5 {
        cycle_then_workers(&harness, &manager).await;
    }
    let bucket = bucket_name(ACCOUNT);
    assert_eq!(harness.bucket.file_count(&bucket).await, 1);

    // 没有新数据时任务保持等待
    let idle = manager.run_cycle().await.unwrap();
    assert_eq!(idle.dispatched, 0);
    assert_eq!(
        harness.external_task(ACCOUNT).await.unwrap().state,
        ExternalTaskState::Pending
    );

    harness
        .tables
        .insert_rows(BillingCopy::Source, ACCOUNT, [at("2024-03-05T10:00:00Z")])
        .await;
    let report = manager.run_cycle().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.purged_files, 1);
    assert_eq!(harness.bucket.file_count(&bucket).await, 0);

    let task = harness.external_task(ACCOUNT).await.unwrap();
    assert_eq!(
        task.segment,
        Some(Segment::new(
            at("2024-03-01T10:00:00Z"),
            at("2024-03-05T10:00:00Z")
        ))
    );
}

#[tokio::test]
async fn test_unscheduled_export_times_out_and_restarts() {
    let harness = TestHarness::new();
    let armed_at = Utc::now() - Duration::hours(2);
    harness
        .seed_external(
            ExternalTaskBuilder::new(ACCOUNT)
                .with_state(ExternalTaskState::WaitingForToBucket)
                .with_iteration(4)
                .with_segment(at("2024-03-01T00:00:00Z"), at("2024-03-02T00:00:00Z"))
                .with_to_bucket_job(Job::armed(
                    armed_at,
                    Duration::minutes(10),
                    Duration::minutes(50),
                ))
                .build(),
        )
        .await
        .unwrap();
    let manager = ExternalManager::new(harness.context());

    manager.run_cycle().await.unwrap();
    let task = harness.external_task(ACCOUNT).await.unwrap();
    assert_eq!(task.state, ExternalTaskState::Failed);
    assert_eq!(
        task.jobs.to_bucket.as_ref().unwrap().status,
        JobStatus::ScheduleTimeout
    );

    // 仓库中没有这个前缀的作业, 说明作业从未启动, 回到等待重试
    manager.run_cycle().await.unwrap();
    let task = harness.external_task(ACCOUNT).await.unwrap();
    assert_eq!(task.state, ExternalTaskState::Pending);
    assert_eq!(task.jobs.to_bucket.unwrap().status, JobStatus::Failed);

    let retry = manager.run_cycle().await.unwrap();
    assert_eq!(retry.dispatched, 1);
    let task = harness.external_task(ACCOUNT).await.unwrap();
    assert_eq!(task.state, ExternalTaskState::WaitingForToBucket);
    assert_eq!(task.iteration, 5);
    assert_eq!(
        task.segment,
        Some(Segment::new(
            at("2024-03-01T00:00:00Z"),
            at("2024-03-02T00:00:00Z")
        ))
    );
}

#[tokio::test]
async fn test_lifecycle_changes_are_applied_at_cycle_end() {
    let harness = TestHarness::new();
    harness
        .seed_external(ExternalTaskBuilder::new("NEW-001").onboarding().build())
        .await
        .unwrap();
    harness
        .seed_external(
            ExternalTaskBuilder::new("OLD-001")
                .with_lifecycle(LifecycleStage::Deprecated)
                .build(),
        )
        .await
        .unwrap();
    harness.tables.create_local_table("OLD-001").await.unwrap();
    let manager = ExternalManager::new(harness.context());

    let report = manager.run_cycle().await.unwrap();
    assert!(report.advanced.is_empty());
    assert_eq!(report.activated, vec!["NEW-001".to_string()]);
    assert_eq!(report.removed, vec!["OLD-001".to_string()]);

    let activated = harness.external_task("NEW-001").await.unwrap();
    assert_eq!(activated.lifecycle_stage, LifecycleStage::Active);
    assert_eq!(activated.state, ExternalTaskState::Pending);
    assert!(harness.external_task("OLD-001").await.unwrap_err().is_not_found());
    assert!(!harness.tables.has_local_table("OLD-001").await);
}

#[tokio::test]
async fn test_cycle_is_rejected_while_previous_lease_is_held() {
    let harness = TestHarness::new();
    harness
        .seed_manager(
            ManagerKind::External,
            ManagerMetadataBuilder::new()
                .with_iteration(7)
                .with_state(ManagerState::TasksUpdated)
                .with_ttl(Utc::now() + Duration::minutes(30))
                .build(),
        )
        .await
        .unwrap();
    let manager = ExternalManager::new(harness.context());

    let err = manager.run_cycle().await.unwrap_err();
    assert!(matches!(err, PipelineError::LeaseHeld { iteration: 7, .. }));
    let doc = harness.manager(ManagerKind::External).await.unwrap();
    assert_eq!(doc.iteration, 7);
    assert_eq!(doc.state, ManagerState::TasksUpdated);
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let harness = TestHarness::new();
    harness
        .seed_manager(
            ManagerKind::External,
            ManagerMetadataBuilder::new()
                .with_iteration(7)
                .with_state(ManagerState::TasksUpdated)
                .with_ttl(Utc::now() - Duration::minutes(1))
                .build(),
        )
        .await
        .unwrap();
    let manager = ExternalManager::new(harness.context());

    let report = manager.run_cycle().await.unwrap();
    assert_eq!(report.iteration, 8);
    let doc = harness.manager(ManagerKind::External).await.unwrap();
    assert_eq!(doc.state, ManagerState::Done);
}
