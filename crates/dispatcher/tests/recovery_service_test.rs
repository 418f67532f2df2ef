use billing_core::models::{InternalTaskState, JobStatus, ManagerState};
use billing_core::PipelineError;
use std::sync::Arc;

use billing_dispatcher::{InternalManager, ManagerRecoveryService, RecoveryConfig, RecoveryService};
use billing_domain::{
    copy_to_unified_prefix, BillingCopy, BillingTables, JobKind, JobSpec, ManagerKind, WarehouseJobs,
    PIPELINE_LOCATION,
};
use billing_infrastructure::ScriptedOutcome;
use billing_testing_utils::{at, InternalTaskBuilder, ManagerMetadataBuilder, TestHarness};
use chrono::{Duration, Utc};

async fn seed_verified(harness: &TestHarness, account: &str, iteration: i64) {
    harness
        .seed_internal(
            InternalTaskBuilder::new(account)
                .with_state(InternalTaskState::Verified)
                .with_iteration(iteration)
                .with_segment(at("2024-05-01T00:00:00Z"), at("2024-05-02T00:00:00Z"))
                .build(),
        )
        .await
        .unwrap();
}

/// 以汇总作业前缀提交一个作业, 模拟进程在记录作业ID之前崩溃
async fn submit_aggregate(harness: &TestHarness, iteration: i64, accounts: &[&str]) -> String {
    let tmp_table = harness.tables.create_tmp_table(iteration).await.unwrap();
    harness
        .warehouse
        .run(&JobSpec {
            job_prefix: copy_to_unified_prefix(iteration),
            location: PIPELINE_LOCATION.to_string(),
            kind: JobKind::CopyTmpToUnified {
                tmp_table,
                billing_account_ids: accounts.iter().map(|a| a.to_string()).collect(),
            },
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_finished_manager_needs_no_recovery() {
    let harness = TestHarness::new();
    let service = ManagerRecoveryService::new(harness.context(), None);

    let report = service.general_recovery().await.unwrap();

    assert!(!report.ran());
    let manager = harness.manager(ManagerKind::Internal).await.unwrap();
    assert_eq!(manager.state, ManagerState::Done);
}

#[tokio::test]
async fn test_live_lease_is_left_alone() {
    let harness = TestHarness::new();
    harness
        .seed_manager(
            ManagerKind::Internal,
            ManagerMetadataBuilder::new()
                .with_iteration(3)
                .with_state(ManagerState::TasksCreated)
                .with_ttl(Utc::now() + Duration::minutes(20))
                .build(),
        )
        .await
        .unwrap();
    let service = ManagerRecoveryService::new(harness.context(), None);

    assert!(!service.general_recovery().await.unwrap().ran());
    assert!(service.single_recovery().await.unwrap().is_empty());
    assert_eq!(
        harness.manager(ManagerKind::Internal).await.unwrap().state,
        ManagerState::TasksCreated
    );
}

#[tokio::test(start_paused = true)]
async fn test_marked_manager_resumes_lost_aggregate_job() {
    let harness = TestHarness::new();
    seed_verified(&harness, "AAA-111", 3).await;
    submit_aggregate(&harness, 3, &["AAA-111"]).await;
    let now = Utc::now();
    harness
        .seed_manager(
            ManagerKind::Internal,
            ManagerMetadataBuilder::new()
                .with_iteration(3)
                .with_state(ManagerState::Marked)
                .with_ttl(now - Duration::minutes(1))
                .with_aggregate_job(None, now + Duration::minutes(30))
                .build(),
        )
        .await
        .unwrap();
    let service = ManagerRecoveryService::new(harness.context(), None);

    let report = service.general_recovery().await.unwrap();

    assert_eq!(report.started_from, Some(ManagerState::Marked));
    assert_eq!(
        report.steps,
        vec![
            ManagerState::CopiedToUnified,
            ManagerState::Notified,
            ManagerState::Done
        ]
    );
    assert!(report.errors.is_empty());

    let manager = harness.manager(ManagerKind::Internal).await.unwrap();
    assert_eq!(manager.state, ManagerState::Done);
    assert!(!manager.recovery.recovering);
    let job = manager.aggregate_job.unwrap();
    assert!(job.has_id());
    assert_eq!(job.status, JobStatus::Done);

    let task = harness.internal_task("AAA-111").await.unwrap();
    assert_eq!(task.state, InternalTaskState::Done);
    assert!(!harness.tables.has_tmp_table(3).await);
}

#[tokio::test(start_paused = true)]
async fn test_aggregate_job_that_never_started_fails_verified_tasks() {
    let harness = TestHarness::new();
    seed_verified(&harness, "AAA-111", 3).await;
    seed_verified(&harness, "BBB-222", 2).await;
    let now = Utc::now();
    harness
        .seed_manager(
            ManagerKind::Internal,
            ManagerMetadataBuilder::new()
                .with_iteration(3)
                .with_state(ManagerState::Marked)
                .with_ttl(now - Duration::minutes(1))
                .with_aggregate_job(None, now + Duration::minutes(30))
                .build(),
        )
        .await
        .unwrap();
    let service = ManagerRecoveryService::new(harness.context(), None);

    let report = service.general_recovery().await.unwrap();

    assert_eq!(report.steps, vec![ManagerState::Failed, ManagerState::Done]);
    assert_eq!(
        harness.internal_task("AAA-111").await.unwrap().state,
        InternalTaskState::Failed
    );
    // 其他迭代的任务不受影响
    assert_eq!(
        harness.internal_task("BBB-222").await.unwrap().state,
        InternalTaskState::Verified
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_aggregate_job_is_not_committed() {
    let harness = TestHarness::new();
    seed_verified(&harness, "AAA-111", 3).await;
    harness
        .warehouse
        .script(
            &copy_to_unified_prefix(3),
            ScriptedOutcome::Fail {
                after_polls: 1,
                cause: "table not found".to_string(),
            },
        )
        .await;
    let job_id = submit_aggregate(&harness, 3, &["AAA-111"]).await;
    let now = Utc::now();
    harness
        .seed_manager(
            ManagerKind::Internal,
            ManagerMetadataBuilder::new()
                .with_iteration(3)
                .with_state(ManagerState::Marked)
                .with_ttl(now - Duration::minutes(1))
                .with_aggregate_job(Some(&job_id), now + Duration::minutes(30))
                .build(),
        )
        .await
        .unwrap();
    let service = ManagerRecoveryService::new(harness.context(), None);

    let report = service.general_recovery().await.unwrap();

    assert_eq!(report.steps, vec![ManagerState::Failed, ManagerState::Done]);
    let manager = harness.manager(ManagerKind::Internal).await.unwrap();
    assert_eq!(manager.aggregate_job.unwrap().status, JobStatus::Failed);
    assert_eq!(
        harness.internal_task("AAA-111").await.unwrap().state,
        InternalTaskState::Failed
    );
}

#[tokio::test]
async fn test_concurrent_recovery_is_rejected() {
    let harness = TestHarness::new();
    let now = Utc::now();
    harness
        .seed_manager(
            ManagerKind::Internal,
            ManagerMetadataBuilder::new()
                .with_iteration(5)
                .with_state(ManagerState::Failed)
                .recovering_until(now + Duration::minutes(10))
                .build(),
        )
        .await
        .unwrap();
    let service = ManagerRecoveryService::new(harness.context(), None);

    let err = service.general_recovery().await.unwrap_err();
    assert!(matches!(err, PipelineError::RecoveryInProgress));
    assert_eq!(
        harness.manager(ManagerKind::Internal).await.unwrap().state,
        ManagerState::Failed
    );
}

#[tokio::test]
async fn test_orphaned_tasks_are_settled() {
    let harness = TestHarness::new();
    harness
        .seed_internal(
            InternalTaskBuilder::new("RUN-001")
                .with_state(InternalTaskState::Running)
                .with_iteration(4)
                .build(),
        )
        .await
        .unwrap();
    harness
        .seed_internal(
            InternalTaskBuilder::new("NOT-001")
                .with_state(InternalTaskState::Notified)
                .with_iteration(4)
                .build(),
        )
        .await
        .unwrap();
    harness
        .seed_internal(InternalTaskBuilder::new("DONE-001").build())
        .await
        .unwrap();
    let service = ManagerRecoveryService::new(harness.context(), None);

    let mut recovered = service.single_recovery().await.unwrap();
    recovered.sort();

    assert_eq!(recovered, vec!["NOT-001".to_string(), "RUN-001".to_string()]);
    assert_eq!(
        harness.internal_task("RUN-001").await.unwrap().state,
        InternalTaskState::Failed
    );
    assert_eq!(
        harness.internal_task("NOT-001").await.unwrap().state,
        InternalTaskState::Done
    );
    assert_eq!(
        harness.internal_task("DONE-001").await.unwrap().state,
        InternalTaskState::Done
    );
}

async fn seed_lost_aggregate(harness: &TestHarness) {
    seed_verified(harness, "AAA-111", 3).await;
    let now = Utc::now();
    harness
        .seed_manager(
            ManagerKind::Internal,
            ManagerMetadataBuilder::new()
                .with_iteration(3)
                .with_state(ManagerState::Marked)
                .with_ttl(now - Duration::minutes(1))
                .with_aggregate_job(None, now + Duration::minutes(30))
                .build(),
        )
        .await
        .unwrap();
}

fn one_step_recovery(harness: &TestHarness) -> ManagerRecoveryService {
    ManagerRecoveryService::new(
        harness.context(),
        Some(RecoveryConfig {
            step_budget: 1,
            ..Default::default()
        }),
    )
}

#[tokio::test]
async fn test_unfinished_ladder_keeps_verified_tasks() {
    let harness = TestHarness::new();
    seed_lost_aggregate(&harness).await;
    let service = one_step_recovery(&harness);

    let err = service.general_recovery().await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::RecoveryIncomplete { iteration: 3, .. }
    ));
    let manager = harness.manager(ManagerKind::Internal).await.unwrap();
    assert_eq!(manager.state, ManagerState::Failed);
    assert!(!manager.recovery.recovering);

    // 阶梯没有走完时已验证的任务不能当作已拷贝
    assert!(service.single_recovery().await.unwrap().is_empty());
    assert_eq!(
        harness.internal_task("AAA-111").await.unwrap().state,
        InternalTaskState::Verified
    );

    let report = service.general_recovery().await.unwrap();
    assert_eq!(report.started_from, Some(ManagerState::Failed));
    assert_eq!(report.final_state, Some(ManagerState::Done));
    assert_eq!(
        harness.internal_task("AAA-111").await.unwrap().state,
        InternalTaskState::Failed
    );
    assert!(harness
        .tables
        .rows(BillingCopy::Unified, "AAA-111")
        .await
        .is_empty());
}

#[tokio::test]
async fn test_cycle_does_not_start_after_unfinished_recovery() {
    let harness = TestHarness::new();
    seed_lost_aggregate(&harness).await;
    let manager =
        InternalManager::with_recovery(harness.context(), Arc::new(one_step_recovery(&harness)));

    let err = manager.run_cycle().await.unwrap_err();

    assert!(matches!(err, PipelineError::RecoveryIncomplete { .. }));
    let stored = harness.manager(ManagerKind::Internal).await.unwrap();
    assert_eq!(stored.iteration, 3);
    assert_eq!(stored.state, ManagerState::Failed);
    assert_eq!(
        harness.internal_task("AAA-111").await.unwrap().state,
        InternalTaskState::Verified
    );
}
