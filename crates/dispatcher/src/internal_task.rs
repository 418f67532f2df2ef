//! 内部任务状态机
//!
//! 周期开始时按当前状态刷新每个账户的任务: 计算新的时间段并为本地表到临时表的拷贝作业布置截止时间。

use billing_core::config::InternalManagerConfig;
use billing_core::models::{
    CopyHistoryStatus, InternalTaskMetadata, InternalTaskState, Job, Segment,
};
use billing_core::PipelineResult;
use billing_domain::BillingCopy;
use chrono::{DateTime, Utc};

/// 事务外计算好的输入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InternalInput {
    /// 需要新时间段的状态才有, 表为空时也是 `None`
    pub next_segment: Option<Segment>,
    /// 跳过状态下本地表的最新一行
    pub newest: Option<DateTime<Utc>>,
}

/// 本轮需要计算新时间段
pub fn needs_segment(task: &InternalTaskMetadata) -> bool {
    match task.state {
        InternalTaskState::Done | InternalTaskState::Initializing => true,
        InternalTaskState::Failed => task.segment.is_none(),
        _ => false,
    }
}

/// 主账户从原始表拷贝, 其他账户从本地表
pub fn source_copy(is_master: bool) -> BillingCopy {
    if is_master {
        BillingCopy::Raw
    } else {
        BillingCopy::Local
    }
}

/// 刷新一个任务, `iteration` 是管理器本轮的迭代号
pub fn update_internal_task(
    mut task: InternalTaskMetadata,
    input: &InternalInput,
    iteration: i64,
    now: DateTime<Utc>,
    cfg: &InternalManagerConfig,
) -> PipelineResult<InternalTaskMetadata> {
    use InternalTaskState as S;

    let arm = |task: &mut InternalTaskMetadata| {
        task.jobs.from_local_to_tmp = Some(Job::armed(
            now,
            cfg.wait_to_start(),
            cfg.task_max_duration(),
        ));
    };

    match task.state {
        S::Onboarding => {
            task.iteration = iteration;
            return Ok(task);
        }
        S::Skipped => {
            let moved = match (input.newest, task.segment) {
                (Some(newest), Some(segment)) => newest != segment.end_time,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if moved {
                task.state = S::Done;
            }
        }
        S::Done | S::Initializing => {
            if task.state == S::Initializing {
                task.copy_history.status = CopyHistoryStatus::Copying;
            }
            if let Some(segment) = input.next_segment {
                task.segment = Some(segment);
            }
            arm(&mut task);
            task.state = match input.next_segment {
                Some(segment) if !segment.is_empty() => S::Pending,
                _ => S::Skipped,
            };
        }
        S::Failed => {
            if task.segment.is_none() {
                task.segment = input.next_segment;
            }
            arm(&mut task);
            task.state = match task.segment {
                Some(segment) if !segment.is_empty() => S::Pending,
                _ => S::Skipped,
            };
        }
        S::Pending | S::Running | S::Verified | S::Notified => return Ok(task),
    }

    task.iteration = iteration;
    task.ttl = Some(now + cfg.task_ttl());
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use billing_core::models::{CopyHistory, InternalTaskJobs, JobStatus, LifecycleStage};
    use chrono::Duration;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn task(state: InternalTaskState) -> InternalTaskMetadata {
        InternalTaskMetadata {
            billing_account_id: "AAA-111".to_string(),
            customer_id: "cust-1".to_string(),
            state,
            iteration: 3,
            ttl: None,
            jobs: InternalTaskJobs::default(),
            segment: Some(Segment::new(
                at("2024-01-01T00:00:00Z"),
                at("2024-02-01T00:00:00Z"),
            )),
            copy_history: CopyHistory {
                target_time: at("2024-02-01T00:00:00Z"),
                status: CopyHistoryStatus::Done,
            },
            lifecycle_stage: LifecycleStage::Active,
            dummy: false,
            onboarding: false,
            oldest_partition: None,
            last_update: None,
        }
    }

    fn next() -> Segment {
        Segment::new(at("2024-02-01T00:00:00Z"), at("2024-02-10T00:00:00Z"))
    }

    #[test]
    fn test_done_task_gets_new_segment_and_job() {
        let now = at("2024-02-10T01:00:00Z");
        let cfg = InternalManagerConfig::default();
        let input = InternalInput {
            next_segment: Some(next()),
            newest: None,
        };
        let after = update_internal_task(task(InternalTaskState::Done), &input, 8, now, &cfg)
            .unwrap();

        assert_eq!(after.state, InternalTaskState::Pending);
        assert_eq!(after.iteration, 8);
        assert_eq!(after.segment, Some(next()));
        assert_eq!(after.ttl, Some(now + Duration::minutes(59)));
        let job = after.jobs.from_local_to_tmp.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.deadlines().unwrap().0, now + Duration::minutes(10));
    }

    #[test]
    fn test_empty_segment_is_skipped_then_resumed() {
        let now = at("2024-02-10T01:00:00Z");
        let cfg = InternalManagerConfig::default();
        let end = at("2024-02-01T00:00:00Z");
        let skipped = update_internal_task(
            task(InternalTaskState::Done),
            &InternalInput {
                next_segment: Some(Segment::new(end, end)),
                newest: None,
            },
            8,
            now,
            &cfg,
        )
        .unwrap();
        assert_eq!(skipped.state, InternalTaskState::Skipped);

        let unchanged = update_internal_task(
            skipped.clone(),
            &InternalInput {
                next_segment: None,
                newest: Some(end),
            },
            9,
            now,
            &cfg,
        )
        .unwrap();
        assert_eq!(unchanged.state, InternalTaskState::Skipped);
        assert_eq!(unchanged.iteration, 9);

        let resumed = update_internal_task(
            skipped,
            &InternalInput {
                next_segment: None,
                newest: Some(end + Duration::hours(1)),
            },
            9,
            now,
            &cfg,
        )
        .unwrap();
        assert_eq!(resumed.state, InternalTaskState::Done);
    }

    #[test]
    fn test_initializing_starts_history_copy() {
        let cfg = InternalManagerConfig::default();
        let mut initializing = task(InternalTaskState::Initializing);
        initializing.segment = None;
        initializing.copy_history.status = CopyHistoryStatus::Pending;
        let after = update_internal_task(
            initializing,
            &InternalInput {
                next_segment: Some(next()),
                newest: None,
            },
            2,
            Utc::now(),
            &cfg,
        )
        .unwrap();
        assert_eq!(after.state, InternalTaskState::Pending);
        assert_eq!(after.copy_history.status, CopyHistoryStatus::Copying);
    }

    #[test]
    fn test_failed_task_retries_stored_segment() {
        let cfg = InternalManagerConfig::default();
        let failed = task(InternalTaskState::Failed);
        let stored = failed.segment;
        assert!(!needs_segment(&failed));
        let after = update_internal_task(
            failed,
            &InternalInput {
                next_segment: Some(next()),
                newest: None,
            },
            5,
            Utc::now(),
            &cfg,
        )
        .unwrap();
        assert_eq!(after.segment, stored);
        assert_eq!(after.state, InternalTaskState::Pending);
    }

    #[test]
    fn test_onboarding_only_follows_iteration() {
        let cfg = InternalManagerConfig::default();
        let onboarding = task(InternalTaskState::Onboarding);
        let after = update_internal_task(
            onboarding.clone(),
            &InternalInput::default(),
            11,
            Utc::now(),
            &cfg,
        )
        .unwrap();
        assert_eq!(after.iteration, 11);
        assert_eq!(after.jobs, onboarding.jobs);
        assert_eq!(after.state, InternalTaskState::Onboarding);
    }

    #[test]
    fn test_master_copies_from_raw() {
        assert_eq!(source_copy(true), BillingCopy::Raw);
        assert_eq!(source_copy(false), BillingCopy::Local);
    }
}
