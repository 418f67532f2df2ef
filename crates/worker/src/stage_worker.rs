use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use billing_core::models::{
    ensure_iteration, BucketData, ExternalTaskMetadata, ExternalTaskState, InternalTaskMetadata,
    InternalTaskState, Job,
};
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{
    bucket_name, local_to_tmp_prefix, paths, staging_uri, tmp_table_name, CopySource,
    ExternalStage, JobKind, JobSpec, PipelineContext, StageRequest, Transactor, PIPELINE_LOCATION,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument};

/// 阶段工作器处理的请求类型, 按请求路径区分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Internal,
    External(ExternalStage),
}

impl StageKind {
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            paths::INTERNAL_TASK => Some(StageKind::Internal),
            paths::EXTERNAL_TO_BUCKET => Some(StageKind::External(ExternalStage::ToBucket)),
            paths::EXTERNAL_FROM_BUCKET => Some(StageKind::External(ExternalStage::FromBucket)),
            _ => None,
        }
    }
}

/// 一次请求的处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Submitted { job_id: String },
    /// 任务已经不在等待状态, 重复投递的请求直接忽略
    Skipped { state: String },
}

/// 阶段请求处理接口
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, path: &str, request: &StageRequest) -> PipelineResult<StageOutcome>;
}

/// 提交仓库作业的阶段工作器
///
/// 先在事务中把任务从等待状态推进到已调度, 再提交作业, 最后记录作业ID。
/// 提交失败时任务停在已调度且没有作业ID, 由管理器在启动截止时间后判为调度超时。
#[derive(Clone)]
pub struct StageWorker {
    ctx: PipelineContext,
}

impl StageWorker {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self), fields(account = %request.billing_account_id, iteration = request.iteration))]
    pub async fn run_internal(&self, request: &StageRequest) -> PipelineResult<StageOutcome> {
        let account = request.billing_account_id.as_str();
        let iteration = request.iteration;
        let store = &self.ctx.store;

        let claimed = AtomicBool::new(false);
        let task = store
            .internal_tasks
            .apply(account, &|mut task: InternalTaskMetadata| {
                ensure_iteration(iteration, task.iteration)?;
                let pending = task.state == InternalTaskState::Pending;
                claimed.store(pending, Ordering::SeqCst);
                if pending {
                    task.state = InternalTaskState::Running;
                }
                Ok(task)
            })
            .await?;
        if !claimed.load(Ordering::SeqCst) {
            debug!("账户 {} 内部任务处于 {}, 忽略", account, task.state);
            return Ok(StageOutcome::Skipped {
                state: task.state.to_string(),
            });
        }

        let segment = task.segment.ok_or_else(|| {
            PipelineError::invalid_state(format!("账户 {account} 内部任务缺少时间段"))
        })?;
        let source = CopySource::for_account(self.ctx.is_master(account));
        let spec = JobSpec {
            job_prefix: local_to_tmp_prefix(account, iteration),
            location: PIPELINE_LOCATION.to_string(),
            kind: JobKind::CopyLocalToTmp {
                billing_account_id: account.to_string(),
                source,
                segment,
                tmp_table: tmp_table_name(iteration),
            },
        };
        let job_id = self.submit(&spec).await?;

        let recorded = job_id.clone();
        store
            .internal_tasks
            .apply(account, &|mut task: InternalTaskMetadata| {
                ensure_iteration(iteration, task.iteration)?;
                record_job(&mut task.jobs.from_local_to_tmp, &recorded);
                Ok(task)
            })
            .await?;
        info!("账户 {} 提交本地表到临时表的拷贝作业 {}", account, job_id);
        Ok(StageOutcome::Submitted { job_id })
    }

    #[instrument(skip(self), fields(account = %request.billing_account_id, iteration = request.iteration, stage = stage.name()))]
    pub async fn run_external(
        &self,
        stage: ExternalStage,
        request: &StageRequest,
    ) -> PipelineResult<StageOutcome> {
        let account = request.billing_account_id.as_str();
        let iteration = request.iteration;
        let store = &self.ctx.store;
        let (waiting, scheduled) = match stage {
            ExternalStage::ToBucket => (
                ExternalTaskState::WaitingForToBucket,
                ExternalTaskState::ToTaskScheduled,
            ),
            ExternalStage::FromBucket => (
                ExternalTaskState::WaitingForFromBucket,
                ExternalTaskState::FromTaskScheduled,
            ),
        };
        // 导出写入的目录由时间戳决定, 在提交前就记录下来, 下一轮可以据此清理
        let timestamp = Utc::now().timestamp();

        let claimed = AtomicBool::new(false);
        let task = store
            .external_tasks
            .apply(account, &|mut task: ExternalTaskMetadata| {
                ensure_iteration(iteration, task.iteration)?;
                let ready = task.state == waiting;
                claimed.store(ready, Ordering::SeqCst);
                if !ready {
                    return Ok(task);
                }
                task.state = scheduled;
                if stage == ExternalStage::ToBucket {
                    let bucket = if task.bucket.bucket_name.is_empty() {
                        bucket_name(account)
                    } else {
                        task.bucket.bucket_name.clone()
                    };
                    task.bucket = BucketData {
                        file_uri: Some(staging_uri(&bucket, account, timestamp)),
                        last_write_timestamp: Some(timestamp),
                        bucket_name: bucket,
                    };
                }
                Ok(task)
            })
            .await?;
        if !claimed.load(Ordering::SeqCst) {
            debug!("账户 {} 外部任务处于 {}, 忽略", account, task.state);
            return Ok(StageOutcome::Skipped {
                state: task.state.to_string(),
            });
        }

        let spec = external_job(&task, stage, iteration)?;
        let job_id = self.submit(&spec).await?;

        let recorded = job_id.clone();
        store
            .external_tasks
            .apply(account, &|mut task: ExternalTaskMetadata| {
                ensure_iteration(iteration, task.iteration)?;
                match stage {
                    ExternalStage::ToBucket => record_job(&mut task.jobs.to_bucket, &recorded),
                    ExternalStage::FromBucket => record_job(&mut task.jobs.from_bucket, &recorded),
                }
                Ok(task)
            })
            .await?;
        info!("账户 {} 提交 {} 作业 {}", account, stage.name(), job_id);
        Ok(StageOutcome::Submitted { job_id })
    }

    async fn submit(&self, spec: &JobSpec) -> PipelineResult<String> {
        self.ctx.warehouse.run(spec).await.inspect_err(|e| {
            error!("提交作业 {} 失败: {}", spec.job_prefix, e);
        })
    }
}

#[async_trait]
impl StageHandler for StageWorker {
    async fn handle(&self, path: &str, request: &StageRequest) -> PipelineResult<StageOutcome> {
        match StageKind::from_path(path) {
            Some(StageKind::Internal) => self.run_internal(request).await,
            Some(StageKind::External(stage)) => self.run_external(stage, request).await,
            None => Err(PipelineError::not_found(path)),
        }
    }
}

fn record_job(job: &mut Option<Job>, job_id: &str) {
    match job {
        Some(job) => job.record_started(job_id),
        None => *job = Some(Job::created(job_id)),
    }
}

/// 按外部任务当前的时间段和暂存信息生成作业
fn external_job(
    task: &ExternalTaskMetadata,
    stage: ExternalStage,
    iteration: i64,
) -> PipelineResult<JobSpec> {
    let account = task.billing_account_id.clone();
    let segment = task.segment.ok_or_else(|| {
        PipelineError::invalid_state(format!("账户 {account} 外部任务缺少时间段"))
    })?;
    let timestamp = task.bucket.last_write_timestamp.ok_or_else(|| {
        PipelineError::invalid_state(format!("账户 {account} 缺少暂存写入时间"))
    })?;
    let bucket = task.bucket.bucket_name.clone();

    let (location, kind) = match stage {
        ExternalStage::ToBucket => {
            let location = if task.source_table.location.is_empty() {
                PIPELINE_LOCATION.to_string()
            } else {
                task.source_table.location.clone()
            };
            (
                location,
                JobKind::ExportToBucket {
                    billing_account_id: account.clone(),
                    source: task.source_table.clone(),
                    segment,
                    bucket,
                    timestamp,
                },
            )
        }
        ExternalStage::FromBucket => (
            PIPELINE_LOCATION.to_string(),
            JobKind::LoadFromBucket {
                billing_account_id: account.clone(),
                bucket,
                timestamp,
                segment,
            },
        ),
    };
    Ok(JobSpec {
        job_prefix: stage.job_prefix(&account, iteration),
        location,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_route_to_stages() {
        assert_eq!(
            StageKind::from_path(paths::INTERNAL_TASK),
            Some(StageKind::Internal)
        );
        assert_eq!(
            StageKind::from_path(paths::EXTERNAL_FROM_BUCKET),
            Some(StageKind::External(ExternalStage::FromBucket))
        );
        assert_eq!(StageKind::from_path("/tasks/unknown"), None);
    }

    #[test]
    fn test_record_job_keeps_deadlines() {
        let now = Utc::now();
        let mut job = Some(Job::armed(
            now,
            chrono::Duration::minutes(10),
            chrono::Duration::minutes(50),
        ));
        record_job(&mut job, "job-1");
        let job = job.unwrap();
        assert!(job.has_id());
        assert!(job.deadlines().is_ok());

        let mut missing = None;
        record_job(&mut missing, "job-2");
        assert_eq!(missing.unwrap().job_id.as_deref(), Some("job-2"));
    }
}
