use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{BillingCopy, CopySource, JobKind, JobObservation, JobSpec, WarehouseJobs};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::storage::InMemoryObjectStore;
use crate::tables::InMemoryBillingTables;

pub const CANCELED_CAUSE: &str = "Job execution was cancelled";

/// 预设的作业行为
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// 第 n 次查询时成功
    Succeed { after_polls: u32 },
    /// 第 n 次查询时失败
    Fail { after_polls: u32, cause: String },
    /// 一直运行, 取消后以错误结束
    Hang,
    /// 一直运行, 忽略取消
    Unresponsive,
}

impl Default for ScriptedOutcome {
    fn default() -> Self {
        ScriptedOutcome::Succeed { after_polls: 1 }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedJob {
    pub job_id: String,
    pub spec: JobSpec,
    pub outcome: ScriptedOutcome,
    pub polls: u32,
    pub cancel_requested: bool,
    pub applied: bool,
}

#[derive(Debug, Default)]
struct WarehouseState {
    jobs: Vec<RecordedJob>,
    scripts: Vec<(String, ScriptedOutcome)>,
}

/// 内存数据仓库
///
/// 作业按前缀匹配预设行为。绑定了账单表时, 作业第一次报告成功时执行对应的数据搬运。
#[derive(Debug, Default)]
pub struct InMemoryWarehouse {
    state: RwLock<WarehouseState>,
    tables: Option<Arc<InMemoryBillingTables>>,
    bucket: Option<Arc<InMemoryObjectStore>>,
    default_outcome: ScriptedOutcome,
    run_fails: AtomicBool,
    cancel_fails: AtomicBool,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(mut self, tables: Arc<InMemoryBillingTables>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn with_bucket(mut self, bucket: Arc<InMemoryObjectStore>) -> Self {
        self.bucket = Some(bucket);
        self
    }

    pub fn with_default_outcome(mut self, outcome: ScriptedOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// 为以 `prefix` 开头的后续作业设置行为, 后设置的优先
    pub async fn script(&self, prefix: &str, outcome: ScriptedOutcome) {
        self.state
            .write()
            .await
            .scripts
            .push((prefix.to_string(), outcome));
    }

    pub fn set_run_fails(&self, fails: bool) {
        self.run_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_cancel_fails(&self, fails: bool) {
        self.cancel_fails.store(fails, Ordering::SeqCst);
    }

    pub async fn jobs(&self) -> Vec<RecordedJob> {
        self.state.read().await.jobs.clone()
    }

    pub async fn job(&self, job_id: &str) -> Option<RecordedJob> {
        self.state
            .read()
            .await
            .jobs
            .iter()
            .find(|job| job.job_id == job_id)
            .cloned()
    }

    async fn apply_effect(&self, spec: &JobSpec) -> PipelineResult<()> {
        let Some(tables) = &self.tables else {
            return Ok(());
        };
        match &spec.kind {
            JobKind::ExportToBucket {
                billing_account_id,
                segment,
                bucket,
                timestamp,
                ..
            } => {
                let rows = tables
                    .export_to_stage(billing_account_id, segment, bucket, *timestamp)
                    .await;
                if let Some(store) = &self.bucket {
                    store
                        .put_file(bucket, billing_account_id, *timestamp, "export-000.json.gz")
                        .await;
                }
                debug!("导出 {} 行到 {}", rows, bucket);
            }
            JobKind::LoadFromBucket {
                billing_account_id,
                bucket,
                timestamp,
                ..
            } => {
                tables
                    .load_from_stage(billing_account_id, bucket, *timestamp)
                    .await?;
            }
            JobKind::CopyLocalToTmp {
                billing_account_id,
                source,
                segment,
                tmp_table,
            } => {
                let copy = match source {
                    CopySource::Local => BillingCopy::Local,
                    CopySource::Raw => BillingCopy::Raw,
                };
                tables
                    .copy_to_tmp(copy, billing_account_id, segment, tmp_table)
                    .await?;
            }
            JobKind::CopyTmpToUnified {
                tmp_table,
                billing_account_ids,
            } => {
                tables
                    .merge_tmp_into_unified(tmp_table, billing_account_ids)
                    .await?;
            }
            JobKind::DeleteFromUnified { billing_account_id } => {
                tables.delete_from_unified(billing_account_id).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WarehouseJobs for InMemoryWarehouse {
    async fn run(&self, spec: &JobSpec) -> PipelineResult<String> {
        if self.run_fails.load(Ordering::SeqCst) {
            return Err(PipelineError::warehouse("提交作业失败"));
        }
        let mut state = self.state.write().await;
        let outcome = state
            .scripts
            .iter()
            .rev()
            .find(|(prefix, _)| spec.job_prefix.starts_with(prefix.as_str()))
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or_else(|| self.default_outcome.clone());
        let job_id = format!("{}{}", spec.job_prefix, Uuid::new_v4().simple());
        info!("提交仓库作业 {}", job_id);
        state.jobs.push(RecordedJob {
            job_id: job_id.clone(),
            spec: spec.clone(),
            outcome,
            polls: 0,
            cancel_requested: false,
            applied: false,
        });
        Ok(job_id)
    }

    async fn status(&self, job_id: &str, _location: &str) -> PipelineResult<JobObservation> {
        let (observation, effect) = {
            let mut state = self.state.write().await;
            let job = state
                .jobs
                .iter_mut()
                .find(|job| job.job_id == job_id)
                .ok_or_else(|| PipelineError::warehouse(format!("作业不存在: {job_id}")))?;
            job.polls += 1;
            let observation = match &job.outcome {
                ScriptedOutcome::Succeed { after_polls } if job.polls >= *after_polls => {
                    JobObservation::Done
                }
                ScriptedOutcome::Fail { after_polls, cause } if job.polls >= *after_polls => {
                    JobObservation::Failed(cause.clone())
                }
                ScriptedOutcome::Unresponsive => JobObservation::Running,
                _ if job.cancel_requested => JobObservation::Failed(CANCELED_CAUSE.to_string()),
                _ => JobObservation::Running,
            };
            let effect = (observation == JobObservation::Done && !job.applied).then(|| {
                job.applied = true;
                job.spec.clone()
            });
            (observation, effect)
        };

        if let Some(spec) = effect {
            self.apply_effect(&spec).await?;
        }
        Ok(observation)
    }

    async fn cancel(&self, job_id: &str, _location: &str) -> PipelineResult<()> {
        if self.cancel_fails.load(Ordering::SeqCst) {
            return Err(PipelineError::warehouse(format!("取消作业失败: {job_id}")));
        }
        let mut state = self.state.write().await;
        match state.jobs.iter_mut().find(|job| job.job_id == job_id) {
            Some(job) => {
                job.cancel_requested = true;
                Ok(())
            }
            None => {
                warn!("取消不存在的作业 {}", job_id);
                Err(PipelineError::warehouse(format!("作业不存在: {job_id}")))
            }
        }
    }

    async fn find_by_prefix(&self, prefix: &str) -> PipelineResult<Option<String>> {
        Ok(self
            .state
            .read()
            .await
            .jobs
            .iter()
            .rev()
            .find(|job| job.job_id.starts_with(prefix))
            .map(|job| job.job_id.clone()))
    }
}
