//! 下游通知
//!
//! 拷贝到统一表之后, 为每个 `Verified` 任务发布下游事件并推进到 `Notified`。
//! 收尾时 `Notified` 任务再转为 `Done`。

use billing_core::models::{
    ensure_iteration, CopyHistoryStatus, InternalTaskMetadata, InternalTaskState,
};
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{BillingCopy, BillingEvent, ImportStatus, PipelineContext, Transactor};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::fanout::{fan_out, FanOutReport};
use crate::segment::anchor_empty;

/// 单个任务发布了哪些事件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub copy_history_finished: bool,
    pub old_partition_updated: bool,
}

/// 历史数据是否已经拷贝到目标时间
fn copy_history_reached(task: &InternalTaskMetadata) -> bool {
    task.copy_history.status == CopyHistoryStatus::Copying
        && task
            .segment
            .is_some_and(|segment| task.copy_history.target_time <= segment.end_time)
}

fn old_partition_touched(task: &InternalTaskMetadata, now: DateTime<Utc>) -> bool {
    task.copy_history.status == CopyHistoryStatus::Done
        && task
            .segment
            .is_some_and(|segment| segment.start_time < now - Duration::days(1))
}

/// 通知一个账户, 任务不在本轮的 `Verified` 状态时不做任何事
pub async fn notify_task(
    ctx: &PipelineContext,
    billing_account_id: &str,
    iteration: i64,
    now: DateTime<Utc>,
) -> PipelineResult<NotifyOutcome> {
    let task = ctx.store.internal_tasks.get(billing_account_id).await?;
    if task.state != InternalTaskState::Verified || task.iteration != iteration {
        debug!("账户 {} 不需要通知 (状态 {})", billing_account_id, task.state);
        return Ok(NotifyOutcome::default());
    }
    let Some(segment) = task.segment else {
        return Err(PipelineError::invalid_state(format!(
            "账户 {billing_account_id} 已验证但没有时间段"
        )));
    };
    let is_master = ctx.is_master(billing_account_id);
    let mut outcome = NotifyOutcome::default();

    let history_reached = copy_history_reached(&task);
    if history_reached && !is_master && !task.dummy {
        let status = ctx.events.import_status(billing_account_id).await?;
        if matches!(status, ImportStatus::Pending | ImportStatus::Started) {
            ctx.events
                .set_import_status(billing_account_id, ImportStatus::Completed)
                .await?;
        }
        let oldest = anchor_empty(
            ctx.tables
                .oldest_record_time(BillingCopy::Local, billing_account_id)
                .await,
            segment.end_time,
        )?;
        ctx.events
            .publish(&BillingEvent::CopyHistoryFinished {
                billing_account_id: billing_account_id.to_string(),
                customer_id: task.customer_id.clone(),
                start_day: oldest.date_naive(),
                end_day: segment.end_time.date_naive(),
            })
            .await?;
        info!("账户 {} 历史数据拷贝完成", billing_account_id);
        outcome.copy_history_finished = true;
    }

    if !is_master && old_partition_touched(&task, now) {
        ctx.events
            .publish(&BillingEvent::OldPartitionUpdated {
                billing_account_id: billing_account_id.to_string(),
                customer_id: task.customer_id.clone(),
                start_day: segment.start_time.date_naive(),
                end_day: segment.end_time.date_naive(),
            })
            .await?;
        outcome.old_partition_updated = true;
    }

    let held = task.iteration;
    ctx.store
        .internal_tasks
        .apply(billing_account_id, &|mut current: InternalTaskMetadata| {
            ensure_iteration(held, current.iteration)?;
            if current.state != InternalTaskState::Verified {
                return Ok(current);
            }
            if history_reached {
                current.copy_history.status = CopyHistoryStatus::Notified;
            }
            current.state = InternalTaskState::Notified;
            Ok(current)
        })
        .await?;
    Ok(outcome)
}

/// 通知本轮所有 `Verified` 任务
pub async fn notify_all(
    ctx: &PipelineContext,
    iteration: i64,
) -> PipelineResult<FanOutReport<NotifyOutcome>> {
    let accounts: Vec<String> = ctx
        .store
        .internal_tasks
        .list()
        .await?
        .into_iter()
        .filter(|(_, task)| task.state == InternalTaskState::Verified && task.iteration == iteration)
        .map(|(account, _)| account)
        .collect();

    let now = Utc::now();
    let shared = ctx.clone();
    Ok(fan_out(accounts, move |account| {
        let ctx = shared.clone();
        async move { notify_task(&ctx, &account, iteration, now).await }
    })
    .await)
}

/// 收尾: 本轮 `Notified` 的任务转为 `Done`, 已通知的历史拷贝也完成
pub async fn complete_notified_tasks(
    ctx: &PipelineContext,
    iteration: i64,
) -> PipelineResult<Vec<String>> {
    let mut completed = Vec::new();
    for (account, task) in ctx.store.internal_tasks.list().await? {
        if task.state != InternalTaskState::Notified || task.iteration != iteration {
            continue;
        }
        ctx.store
            .internal_tasks
            .apply(&account, &|mut current: InternalTaskMetadata| {
                ensure_iteration(iteration, current.iteration)?;
                if current.state == InternalTaskState::Notified {
                    current.state = InternalTaskState::Done;
                    if current.copy_history.status == CopyHistoryStatus::Notified {
                        current.copy_history.status = CopyHistoryStatus::Done;
                    }
                }
                Ok(current)
            })
            .await?;
        completed.push(account);
    }
    Ok(completed)
}
