use async_trait::async_trait;
use billing_core::models::{BillingTableInfo, Segment};
use billing_core::PipelineResult;
use serde::{Deserialize, Serialize};

/// 一次状态查询观察到的作业结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobObservation {
    Running,
    Done,
    Failed(String),
}

/// 本地拷贝的来源表, 主账户从原始表拷贝
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopySource {
    Local,
    Raw,
}

impl CopySource {
    /// 主账户从原始表拷贝, 其他账户从本地表
    pub fn for_account(is_master: bool) -> Self {
        if is_master {
            CopySource::Raw
        } else {
            CopySource::Local
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    ExportToBucket {
        billing_account_id: String,
        source: BillingTableInfo,
        segment: Segment,
        bucket: String,
        timestamp: i64,
    },
    LoadFromBucket {
        billing_account_id: String,
        bucket: String,
        timestamp: i64,
        segment: Segment,
    },
    CopyLocalToTmp {
        billing_account_id: String,
        source: CopySource,
        segment: Segment,
        tmp_table: String,
    },
    CopyTmpToUnified {
        tmp_table: String,
        billing_account_ids: Vec<String>,
    },
    DeleteFromUnified {
        billing_account_id: String,
    },
}

/// 一个仓库作业的描述
///
/// 作业ID由 `job_prefix` 加随机后缀组成, 丢失元数据后可以按前缀找回。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_prefix: String,
    pub location: String,
    pub kind: JobKind,
}

/// 数据仓库作业接口
#[async_trait]
pub trait WarehouseJobs: Send + Sync {
    async fn run(&self, spec: &JobSpec) -> PipelineResult<String>;

    async fn status(&self, job_id: &str, location: &str) -> PipelineResult<JobObservation>;

    async fn cancel(&self, job_id: &str, location: &str) -> PipelineResult<()>;

    /// 在近期作业中按前缀查找
    async fn find_by_prefix(&self, prefix: &str) -> PipelineResult<Option<String>>;
}
