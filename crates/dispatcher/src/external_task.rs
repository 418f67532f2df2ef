//! 外部任务状态机
//!
//! 每个周期对每个账户执行一次纯更新: 异步输入 (新时间段, 作业状态, 失败作业的处理结果)
//! 在事务之外计算好, 事务内只做状态转换。

use billing_core::config::ExternalManagerConfig;
use billing_core::models::{
    BucketData, ExternalTaskMetadata, ExternalTaskState, Job, JobStatus, Segment,
};
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{bucket_name, ExternalStage};
use chrono::{DateTime, Utc};

use crate::supervisor::Observation;

/// 失败作业的处理结果
#[derive(Debug, Clone, PartialEq)]
pub struct FailedJobRecovery {
    pub stage: ExternalStage,
    pub result: Result<Job, String>,
}

/// 事务外计算好的输入
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ExternalInput {
    #[default]
    None,
    NextSegment(Segment),
    Observed(Observation),
    Recovered(FailedJobRecovery),
}

pub fn stage_job(task: &ExternalTaskMetadata, stage: ExternalStage) -> Option<&Job> {
    match stage {
        ExternalStage::ToBucket => task.jobs.to_bucket.as_ref(),
        ExternalStage::FromBucket => task.jobs.from_bucket.as_ref(),
    }
}

fn stage_job_mut(task: &mut ExternalTaskMetadata, stage: ExternalStage) -> PipelineResult<&mut Job> {
    let account = task.billing_account_id.clone();
    let job = match stage {
        ExternalStage::ToBucket => task.jobs.to_bucket.as_mut(),
        ExternalStage::FromBucket => task.jobs.from_bucket.as_mut(),
    };
    job.ok_or_else(|| {
        PipelineError::invalid_state(format!("账户 {} 缺少 {} 作业", account, stage.name()))
    })
}

/// 失败状态下需要处理的阶段, 先处理导出作业
pub fn failed_stage(task: &ExternalTaskMetadata) -> Option<ExternalStage> {
    let not_done = |job: Option<&Job>| job.is_some_and(|j| !j.status.is_done());
    if not_done(task.jobs.to_bucket.as_ref()) {
        Some(ExternalStage::ToBucket)
    } else if not_done(task.jobs.from_bucket.as_ref()) {
        Some(ExternalStage::FromBucket)
    } else {
        None
    }
}

/// 转换后需要分发给阶段工作器的阶段
pub fn dispatch_stage(task: &ExternalTaskMetadata) -> Option<ExternalStage> {
    match task.state {
        ExternalTaskState::WaitingForToBucket => Some(ExternalStage::ToBucket),
        ExternalTaskState::WaitingForFromBucket => Some(ExternalStage::FromBucket),
        _ => None,
    }
}

/// 开始新一轮导出时需要删除的上一轮暂存文件
pub fn purge_target(
    before: &ExternalTaskMetadata,
    after: &ExternalTaskMetadata,
) -> Option<(String, i64)> {
    let started = before.state == ExternalTaskState::Pending
        && after.state == ExternalTaskState::WaitingForToBucket;
    match (started, before.bucket.last_write_timestamp) {
        (true, Some(timestamp)) => Some((before.bucket.bucket_name.clone(), timestamp)),
        _ => None,
    }
}

/// 执行一次状态转换
pub fn update_external_task(
    mut task: ExternalTaskMetadata,
    input: &ExternalInput,
    now: DateTime<Utc>,
    cfg: &ExternalManagerConfig,
) -> PipelineResult<ExternalTaskMetadata> {
    use ExternalTaskState as S;

    match task.state {
        S::Pending => {
            task.iteration += 1;
            let segment = match input {
                ExternalInput::NextSegment(segment) => *segment,
                _ if task.jobs.both_done() => return Ok(task),
                // 上一次失败, 重试同一个时间段
                _ => task.segment.ok_or_else(|| {
                    PipelineError::invalid_state(format!(
                        "账户 {} 重试时缺少时间段",
                        task.billing_account_id
                    ))
                })?,
            };
            if segment.is_empty() {
                return Ok(task);
            }
            task.segment = Some(segment);
            task.bucket = BucketData::cleared(if task.bucket.bucket_name.is_empty() {
                bucket_name(&task.billing_account_id)
            } else {
                task.bucket.bucket_name.clone()
            });
            task.jobs.from_bucket = None;
            task.jobs.to_bucket = Some(Job::armed(
                now,
                cfg.wait_to_start(),
                cfg.job_finish(task.onboarding),
            ));
            task.state = S::WaitingForToBucket;
        }
        S::WaitingForToBucket | S::ToTaskScheduled => {
            wait_for_schedule(&mut task, ExternalStage::ToBucket, S::ToBucket, now)?;
        }
        S::WaitingForFromBucket | S::FromTaskScheduled => {
            wait_for_schedule(&mut task, ExternalStage::FromBucket, S::FromBucket, now)?;
        }
        S::ToBucket => {
            if let Some(finished) = observe_stage(&mut task, ExternalStage::ToBucket, input, now)? {
                if finished {
                    task.jobs.from_bucket = Some(Job::armed(
                        now,
                        cfg.wait_to_start(),
                        cfg.job_finish(task.onboarding),
                    ));
                    task.state = S::WaitingForFromBucket;
                } else {
                    task.state = S::Failed;
                }
            }
        }
        S::FromBucket => {
            if let Some(finished) = observe_stage(&mut task, ExternalStage::FromBucket, input, now)?
            {
                task.state = match (finished, task.onboarding) {
                    (true, true) => S::DoneOnboarding,
                    (true, false) => S::Pending,
                    (false, _) => S::Failed,
                };
            }
        }
        S::Failed => match input {
            ExternalInput::Recovered(recovery) => apply_recovery(&mut task, recovery)?,
            _ if task.jobs.both_done() => task.state = S::Pending,
            _ => {}
        },
        S::DoneOnboarding => {}
    }
    Ok(task)
}

/// 等待阶段工作器提交作业; 启动截止时间过后仍没有作业ID则判为调度超时
fn wait_for_schedule(
    task: &mut ExternalTaskMetadata,
    stage: ExternalStage,
    running: ExternalTaskState,
    now: DateTime<Utc>,
) -> PipelineResult<()> {
    let job = stage_job_mut(task, stage)?;
    if job.has_id() {
        task.state = running;
    } else if job.start_deadline_passed(now)? {
        job.status = JobStatus::ScheduleTimeout;
        task.state = ExternalTaskState::Failed;
    }
    Ok(())
}

/// 根据一次状态查询更新作业, 返回 `Some(true)` 表示完成, `Some(false)` 表示失败
fn observe_stage(
    task: &mut ExternalTaskMetadata,
    stage: ExternalStage,
    input: &ExternalInput,
    now: DateTime<Utc>,
) -> PipelineResult<Option<bool>> {
    let job = stage_job_mut(task, stage)?;
    let (_, finish_by) = job.deadlines()?;
    let ExternalInput::Observed(observation) = input else {
        return Ok(None);
    };
    let finished = match observation {
        Observation::Done => {
            job.status = JobStatus::Done;
            Some(true)
        }
        Observation::Failed(_) => {
            job.status = JobStatus::Failed;
            Some(false)
        }
        _ if now > finish_by => {
            job.status = JobStatus::Timeout;
            Some(false)
        }
        _ => None,
    };
    Ok(finished)
}

fn apply_recovery(
    task: &mut ExternalTaskMetadata,
    recovery: &FailedJobRecovery,
) -> PipelineResult<()> {
    use ExternalTaskState as S;

    let status = match &recovery.result {
        Ok(job) => {
            *stage_job_mut(task, recovery.stage)? = job.clone();
            job.status
        }
        Err(cause) => match recovery.stage {
            ExternalStage::ToBucket => {
                task.state = S::Pending;
                return Ok(());
            }
            ExternalStage::FromBucket => {
                return Err(PipelineError::JobExecutionFailure {
                    job_id: stage_job(task, recovery.stage)
                        .and_then(|job| job.job_id.clone())
                        .unwrap_or_default(),
                    cause: cause.clone(),
                });
            }
        },
    };

    task.state = match (recovery.stage, status) {
        (_, JobStatus::Failed) => S::Pending,
        (ExternalStage::ToBucket, JobStatus::Done) => S::ToBucket,
        (ExternalStage::FromBucket, JobStatus::Done) => S::Pending,
        _ => S::Failed,
    };
    Ok(())
}
