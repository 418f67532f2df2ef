use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};

/// 仓库作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Created,
    Done,
    Failed,
    Timeout,
    ScheduleTimeout,
    Canceling,
    Canceled,
    Stuck,
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, JobStatus::Done)
    }
}

/// 一个阶段对应的异步仓库作业
///
/// 两个截止时间只能通过 [`Job::armed`] 同时设置。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Job {
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub wait_to_start_timeout: Option<DateTime<Utc>>,
    pub wait_to_finish_timeout: Option<DateTime<Utc>>,
}

impl Job {
    /// 创建一个等待调度的新作业
    pub fn armed(now: DateTime<Utc>, start_budget: Duration, finish_budget: Duration) -> Self {
        Self {
            job_id: None,
            status: JobStatus::Pending,
            wait_to_start_timeout: Some(now + start_budget),
            wait_to_finish_timeout: Some(now + finish_budget),
        }
    }

    /// 已知作业ID时的作业, 用于恢复流程
    pub fn created(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            status: JobStatus::Created,
            wait_to_start_timeout: None,
            wait_to_finish_timeout: None,
        }
    }

    pub fn deadlines(&self) -> PipelineResult<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.wait_to_start_timeout, self.wait_to_finish_timeout) {
            (Some(start), Some(finish)) => Ok((start, finish)),
            _ => Err(PipelineError::invalid_state(format!(
                "作业缺少截止时间: {:?}",
                self.job_id
            ))),
        }
    }

    pub fn require_id(&self) -> PipelineResult<&str> {
        self.job_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PipelineError::invalid_state("作业缺少ID"))
    }

    pub fn has_id(&self) -> bool {
        self.job_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn start_deadline_passed(&self, now: DateTime<Utc>) -> PipelineResult<bool> {
        let (start, _) = self.deadlines()?;
        Ok(now > start)
    }

    pub fn record_started(&mut self, job_id: impl Into<String>) {
        self.job_id = Some(job_id.into());
        self.status = JobStatus::Created;
    }
}
