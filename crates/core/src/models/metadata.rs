//! 元数据文档
//!
//! 每个账户两份任务文档 (内部/外部), 外加两个管理器单例文档和对账检查点。
//! 所有修改都经过存储的事务原语, 并以迭代号作为乐观并发的栅栏。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::Job;
use super::segment::Segment;
use super::states::{
    CopyHistoryStatus, ExternalTaskState, InternalTaskState, LifecycleStage, ManagerState,
};
use crate::errors::{PipelineError, PipelineResult};

/// 可被事务存储保存的文档
pub trait Document: Clone + Send + Sync + 'static {
    fn set_last_update(&mut self, at: DateTime<Utc>);
}

/// 迭代号栅栏: 持有的迭代号必须与存储中的一致
pub fn ensure_iteration(held: i64, stored: i64) -> PipelineResult<()> {
    if held != stored {
        return Err(PipelineError::stale_iteration(held, stored));
    }
    Ok(())
}

/// 客户账单表描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BillingTableInfo {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    pub location: String,
}

impl BillingTableInfo {
    pub fn full_name(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// 暂存桶信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BucketData {
    pub bucket_name: String,
    pub last_write_timestamp: Option<i64>,
    pub file_uri: Option<String>,
}

impl BucketData {
    pub fn cleared(bucket_name: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            last_write_timestamp: None,
            file_uri: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExternalTaskJobs {
    pub to_bucket: Option<Job>,
    pub from_bucket: Option<Job>,
}

impl ExternalTaskJobs {
    /// 首次运行时没有作业, 视为已完成
    pub fn both_done(&self) -> bool {
        let done = |job: &Option<Job>| job.as_ref().is_none_or(|j| j.status.is_done());
        done(&self.to_bucket) && done(&self.from_bucket)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTaskMetadata {
    pub billing_account_id: String,
    pub customer_id: String,
    pub state: ExternalTaskState,
    pub iteration: i64,
    pub jobs: ExternalTaskJobs,
    pub segment: Option<Segment>,
    pub bucket: BucketData,
    pub onboarding: bool,
    pub lifecycle_stage: LifecycleStage,
    pub source_table: BillingTableInfo,
    pub last_update: Option<DateTime<Utc>>,
}

impl Document for ExternalTaskMetadata {
    fn set_last_update(&mut self, at: DateTime<Utc>) {
        self.last_update = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InternalTaskJobs {
    pub from_local_to_tmp: Option<Job>,
    pub delete_from_unified: Option<Job>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyHistory {
    pub target_time: DateTime<Utc>,
    pub status: CopyHistoryStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalTaskMetadata {
    pub billing_account_id: String,
    pub customer_id: String,
    pub state: InternalTaskState,
    pub iteration: i64,
    pub ttl: Option<DateTime<Utc>>,
    pub jobs: InternalTaskJobs,
    pub segment: Option<Segment>,
    pub copy_history: CopyHistory,
    pub lifecycle_stage: LifecycleStage,
    pub dummy: bool,
    pub onboarding: bool,
    pub oldest_partition: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

impl Document for InternalTaskMetadata {
    fn set_last_update(&mut self, at: DateTime<Utc>) {
        self.last_update = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RecoveryInfo {
    pub recovering: bool,
    pub recovering_ttl: Option<DateTime<Utc>>,
    pub iteration: i64,
}

impl RecoveryInfo {
    pub fn in_progress(&self, now: DateTime<Utc>) -> bool {
        self.recovering && self.recovering_ttl.is_some_and(|ttl| now < ttl)
    }
}

/// 管理器单例文档 (内部与外部共用)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ManagerMetadata {
    pub iteration: i64,
    pub ttl: Option<DateTime<Utc>>,
    pub state: ManagerState,
    pub recovery: RecoveryInfo,
    /// 跨账户汇总作业, 仅内部管理器使用
    pub aggregate_job: Option<Job>,
    pub last_update: Option<DateTime<Utc>>,
}

impl Document for ManagerMetadata {
    fn set_last_update(&mut self, at: DateTime<Utc>) {
        self.last_update = Some(at);
    }
}

impl ManagerMetadata {
    pub fn lease(&self) -> Lease {
        Lease {
            holder_iteration: self.iteration,
            ttl: self.ttl,
        }
    }
}

/// 管理器租约
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub holder_iteration: i64,
    pub ttl: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl.is_none_or(|ttl| now >= ttl)
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.ttl
            .map(|ttl| (ttl - now).num_seconds().max(0))
            .unwrap_or(0)
    }
}

/// 对账检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReconciliationCheckpoint {
    pub billing_account_id: String,
    pub last_validated: Option<DateTime<Utc>>,
    pub last_mismatch_count: usize,
    pub last_update: Option<DateTime<Utc>>,
}

impl Document for ReconciliationCheckpoint {
    fn set_last_update(&mut self, at: DateTime<Utc>) {
        self.last_update = Some(at);
    }
}
