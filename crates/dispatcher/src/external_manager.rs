//! 外部管理器
//!
//! 每个周期: 认领 → 推进每个账户的外部任务并分发阶段工作器 → 等待暂存文件删除
//! → 结束账户接入 → 生命周期处理 → 收尾。

use std::collections::HashMap;
use std::sync::Arc;

use billing_core::models::{
    ensure_iteration, ExternalTaskMetadata, ExternalTaskState, InternalTaskMetadata,
    InternalTaskState, Job, JobStatus, LifecycleStage, ManagerState, Segment,
};
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{
    BillingCopy, ExternalStage, ManagerKind, PipelineContext, StageRequest, TaskRequest,
    Transactor, PIPELINE_LOCATION,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::cancellation::CancellationScope;
use crate::external_task::{
    dispatch_stage, failed_stage, purge_target, stage_job, update_external_task, ExternalInput,
    FailedJobRecovery,
};
use crate::fanout::fan_out;
use crate::lease;
use crate::metrics;
use crate::notifications::{self, send_alert};
use crate::segment::load_next_segment;
use crate::supervisor::{JobOutcome, JobSupervisor, Observation};

/// 一个外部周期的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExternalCycleReport {
    pub iteration: i64,
    pub advanced: Vec<String>,
    pub failed: Vec<String>,
    pub dispatched: usize,
    pub purged_files: usize,
    pub onboarded: Vec<String>,
    pub activated: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone)]
struct TaskAdvance {
    purge: Option<(String, i64)>,
    dispatched: Option<ExternalStage>,
}

/// 外部任务的作业所在区域: 导出在客户表所在区域, 导入在流水线区域
pub fn job_location(task: &ExternalTaskMetadata, stage: ExternalStage) -> String {
    match stage {
        ExternalStage::ToBucket if !task.source_table.location.is_empty() => {
            task.source_table.location.clone()
        }
        _ => PIPELINE_LOCATION.to_string(),
    }
}

#[derive(Clone)]
pub struct ExternalManager {
    ctx: PipelineContext,
    supervisor: JobSupervisor,
}

impl ExternalManager {
    pub fn new(ctx: PipelineContext) -> Self {
        let supervisor = JobSupervisor::from_context(&ctx);
        Self { ctx, supervisor }
    }

    /// 执行一个完整周期
    #[instrument(skip(self), fields(manager = "external"))]
    pub async fn run_cycle(&self) -> PipelineResult<ExternalCycleReport> {
        let cfg = &self.ctx.config.external_manager;
        let now = Utc::now();
        let manager =
            match lease::catch(&self.ctx.store, ManagerKind::External, cfg.ttl(), now).await {
                Ok(manager) => manager,
                Err(e) => {
                    warn!("外部管理器无法开始新周期: {}", e);
                    metrics::record_cycle("external", "rejected");
                    return Err(e);
                }
            };
        let iteration = manager.iteration;
        let deadline = manager.ttl.unwrap_or(now + cfg.ttl());
        let scope = CancellationScope::until(deadline);

        match self.drive(iteration, deadline, &scope).await {
            Ok(report) => {
                lease::tear_down(&self.ctx.store, ManagerKind::External, iteration).await?;
                info!(
                    "外部管理器迭代 {} 完成: 推进 {} 个账户, 失败 {} 个",
                    iteration,
                    report.advanced.len(),
                    report.failed.len()
                );
                metrics::record_cycle("external", "done");
                Ok(report)
            }
            Err(e) => {
                error!("外部管理器迭代 {} 失败: {}", iteration, e);
                if let Err(mark_err) =
                    lease::mark_failed(&self.ctx.store, ManagerKind::External, iteration).await
                {
                    error!("标记外部管理器失败状态出错: {}", mark_err);
                }
                send_alert(
                    self.ctx.notifier.as_ref(),
                    notifications::cycle_failed(
                        &self.ctx.config.notifications,
                        ManagerKind::External,
                        iteration,
                        &e,
                    ),
                )
                .await;
                metrics::record_cycle("external", "failed");
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        iteration: i64,
        deadline: DateTime<Utc>,
        scope: &CancellationScope,
    ) -> PipelineResult<ExternalCycleReport> {
        let mut report = ExternalCycleReport {
            iteration,
            ..Default::default()
        };

        let accounts = self.active_accounts().await?;
        debug!("外部管理器迭代 {} 处理 {} 个账户", iteration, accounts.len());
        let this = self.clone();
        let advanced = fan_out(accounts, move |account| {
            let this = this.clone();
            async move { this.advance_account(&account, deadline).await }
        })
        .await;

        for (account, advance) in &advanced.succeeded {
            report.advanced.push(account.clone());
            if advance.dispatched.is_some() {
                report.dispatched += 1;
            }
        }
        if !advanced.is_clean() {
            warn!(
                "外部管理器迭代 {} 推进了 {}/{} 个账户",
                iteration,
                advanced.succeeded.len(),
                advanced.total()
            );
            for (account, e) in &advanced.failed {
                warn!("账户 {} 的外部任务本轮未推进: {}", account, e);
                report.failed.push(account.clone());
            }
        }
        if !advanced.failed.is_empty() {
            send_alert(
                self.ctx.notifier.as_ref(),
                notifications::account_errors(
                    &self.ctx.config.notifications,
                    ManagerKind::External,
                    iteration,
                    &advanced.failed,
                ),
            )
            .await;
        }
        lease::advance(
            &self.ctx.store,
            ManagerKind::External,
            iteration,
            ManagerState::TasksUpdated,
        )
        .await?;

        let purges: HashMap<String, (String, i64)> = advanced
            .succeeded
            .into_iter()
            .filter_map(|(account, advance)| advance.purge.map(|target| (account, target)))
            .collect();
        report.purged_files = self.wait_until_files_deleted(purges, scope).await;

        report.onboarded = self.mark_onboarding_done().await?;
        let (activated, removed) = self.handle_lifecycle_changes().await?;
        report.activated = activated;
        report.removed = removed;
        Ok(report)
    }

    async fn active_accounts(&self) -> PipelineResult<Vec<String>> {
        Ok(self
            .ctx
            .store
            .external_tasks
            .list()
            .await?
            .into_iter()
            .filter(|(_, task)| task.lifecycle_stage == LifecycleStage::Active)
            .map(|(account, _)| account)
            .collect())
    }

    /// 推进一个账户的外部任务
    async fn advance_account(
        &self,
        account: &str,
        manager_ttl: DateTime<Utc>,
    ) -> PipelineResult<TaskAdvance> {
        let store = &self.ctx.store;
        let task = store.external_tasks.get(account).await?;
        let now = Utc::now();
        let input = self.prepare_input(&task, manager_ttl, now).await?;
        let cfg = self.ctx.config.external_manager.clone();
        let (held_iteration, held_state) = (task.iteration, task.state);

        let result = store
            .external_tasks
            .apply(account, &|current: ExternalTaskMetadata| {
                ensure_iteration(held_iteration, current.iteration)?;
                if current.state != held_state {
                    // 阶段工作器已经推进了这个任务
                    return Ok(current);
                }
                update_external_task(current, &input, now, &cfg)
            })
            .await;

        let updated = match result {
            Ok(updated) => updated,
            Err(PipelineError::InvalidMetadataState(msg)) => {
                error!("账户 {} 外部任务元数据无效, 标记为失败: {}", account, msg);
                store
                    .external_tasks
                    .apply(account, &|mut current: ExternalTaskMetadata| {
                        ensure_iteration(held_iteration, current.iteration)?;
                        current.state = ExternalTaskState::Failed;
                        Ok(current)
                    })
                    .await?;
                return Err(PipelineError::InvalidMetadataState(msg));
            }
            Err(e) => return Err(e),
        };

        if updated.state != held_state {
            info!(
                "账户 {} 外部任务 {} -> {} (迭代 {})",
                account, held_state, updated.state, updated.iteration
            );
        }

        let dispatched = dispatch_stage(&updated);
        if let Some(stage) = dispatched {
            self.dispatch(&updated, stage).await?;
        }
        Ok(TaskAdvance {
            purge: purge_target(&task, &updated),
            dispatched,
        })
    }

    /// 在事务之外准备状态转换需要的输入
    async fn prepare_input(
        &self,
        task: &ExternalTaskMetadata,
        manager_ttl: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PipelineResult<ExternalInput> {
        let input = match task.state {
            ExternalTaskState::Pending if task.jobs.both_done() => {
                let next = load_next_segment(
                    self.ctx.tables.as_ref(),
                    BillingCopy::Source,
                    &task.billing_account_id,
                    task.segment.as_ref(),
                    self.ctx.config.external_manager.segment_cap_months,
                )
                .await?;
                let anchor = task.segment.map(|s| s.end_time).unwrap_or(now);
                ExternalInput::NextSegment(next.unwrap_or(Segment::new(anchor, anchor)))
            }
            ExternalTaskState::ToBucket | ExternalTaskState::FromBucket => {
                let stage = if task.state == ExternalTaskState::ToBucket {
                    ExternalStage::ToBucket
                } else {
                    ExternalStage::FromBucket
                };
                match stage_job(task, stage).and_then(|job| job.job_id.clone()) {
                    Some(job_id) => ExternalInput::Observed(
                        self.supervisor
                            .observe(&job_id, &job_location(task, stage))
                            .await,
                    ),
                    None => ExternalInput::Observed(Observation::NotStarted),
                }
            }
            ExternalTaskState::Failed => match failed_stage(task) {
                Some(stage) => ExternalInput::Recovered(FailedJobRecovery {
                    stage,
                    result: self.recover_failed_job(task, stage, manager_ttl, now).await,
                }),
                None => ExternalInput::None,
            },
            _ => ExternalInput::None,
        };
        Ok(input)
    }

    /// 处理失败阶段的作业: 找回丢失的作业ID, 取消超时作业并确认结果
    async fn recover_failed_job(
        &self,
        task: &ExternalTaskMetadata,
        stage: ExternalStage,
        manager_ttl: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, String> {
        let account = &task.billing_account_id;
        let mut job = stage_job(task, stage)
            .cloned()
            .ok_or_else(|| format!("账户 {} 缺少 {} 作业", account, stage.name()))?;
        if now > manager_ttl {
            return Err(format!("外部管理器租约已过期, 跳过账户 {account}"));
        }

        if job.status == JobStatus::ScheduleTimeout && !job.has_id() {
            let prefix = stage.job_prefix(account, task.iteration);
            match self.ctx.warehouse.find_by_prefix(&prefix).await {
                Ok(Some(job_id)) => {
                    info!("按前缀 {} 找回作业 {}", prefix, job_id);
                    job.job_id = Some(job_id);
                    job.status = JobStatus::Timeout;
                }
                Ok(None) => {
                    info!("没有找到前缀为 {} 的作业, 作业从未启动", prefix);
                    job.status = JobStatus::Failed;
                    return Ok(job);
                }
                Err(e) => return Err(e.to_string()),
            }
        }

        match job.status {
            JobStatus::Done | JobStatus::Failed => Ok(job),
            JobStatus::Canceled => {
                job.status = JobStatus::Failed;
                Ok(job)
            }
            _ => {
                let Some(job_id) = job.job_id.clone().filter(|id| !id.is_empty()) else {
                    job.status = JobStatus::Failed;
                    return Ok(job);
                };
                let cancel_by =
                    manager_ttl.min(now + self.ctx.config.supervisor.cancel_budget());
                let outcome = self
                    .supervisor
                    .cancel_and_confirm(&job_id, &job_location(task, stage), cancel_by)
                    .await;
                job.status = match outcome {
                    JobOutcome::Done | JobOutcome::CancelButFinished => JobStatus::Done,
                    JobOutcome::Canceled | JobOutcome::Failed(_) => JobStatus::Failed,
                    JobOutcome::Stuck => JobStatus::Stuck,
                };
                Ok(job)
            }
        }
    }

    async fn dispatch(&self, task: &ExternalTaskMetadata, stage: ExternalStage) -> PipelineResult<()> {
        let body = serde_json::to_value(StageRequest {
            billing_account_id: task.billing_account_id.clone(),
            iteration: task.iteration,
        })?;
        self.ctx
            .queue
            .enqueue(TaskRequest::post(
                &self.ctx.config.queues.external_tasks,
                stage.path(),
                body,
            ))
            .await
    }

    /// 删除上一轮的暂存文件, 最多等到周期截止时间
    async fn wait_until_files_deleted(
        &self,
        purges: HashMap<String, (String, i64)>,
        scope: &CancellationScope,
    ) -> usize {
        if purges.is_empty() {
            return 0;
        }
        let bucket = self.ctx.bucket.clone();
        let targets = Arc::new(purges);
        let keys: Vec<String> = targets.keys().cloned().collect();
        let deleting = fan_out(keys, move |account| {
            let bucket = bucket.clone();
            let targets = targets.clone();
            async move {
                let Some((bucket_name, timestamp)) = targets.get(&account).cloned() else {
                    return Ok(0);
                };
                bucket.delete_prefix(&bucket_name, &account, timestamp).await
            }
        });

        tokio::select! {
            report = deleting => {
                for (account, e) in &report.failed {
                    warn!("删除账户 {} 的暂存文件失败: {}", account, e);
                }
                report.succeeded.iter().map(|(_, deleted)| deleted).sum()
            }
            _ = scope.cancelled() => {
                warn!("等待暂存文件删除时周期到期");
                0
            }
        }
    }

    /// 首次拷贝完成的账户结束接入: 内部任务开始初始化, 外部任务进入常规周期
    async fn mark_onboarding_done(&self) -> PipelineResult<Vec<String>> {
        let store = &self.ctx.store;
        let mut onboarded = Vec::new();
        for (account, task) in store.external_tasks.list().await? {
            if task.state != ExternalTaskState::DoneOnboarding {
                continue;
            }

            let internal = store
                .internal_tasks
                .apply(&account, &|mut internal: InternalTaskMetadata| {
                    if internal.onboarding {
                        internal.onboarding = false;
                        internal.state = InternalTaskState::Initializing;
                    }
                    Ok(internal)
                })
                .await;
            if let Err(e) = internal {
                error!("账户 {} 的内部任务无法结束接入: {}", account, e);
                continue;
            }

            let held = task.iteration;
            store
                .external_tasks
                .apply(&account, &|mut external: ExternalTaskMetadata| {
                    ensure_iteration(held, external.iteration)?;
                    if external.state == ExternalTaskState::DoneOnboarding {
                        external.state = ExternalTaskState::Pending;
                        external.onboarding = false;
                    }
                    Ok(external)
                })
                .await?;
            info!("账户 {} 完成接入", account);
            onboarded.push(account);
        }
        Ok(onboarded)
    }

    /// 生命周期处理, 返回 (激活的账户, 删除的账户)
    async fn handle_lifecycle_changes(&self) -> PipelineResult<(Vec<String>, Vec<String>)> {
        let store = &self.ctx.store;
        let mut activated = Vec::new();
        let mut removed = Vec::new();
        for (account, task) in store.external_tasks.list().await? {
            match task.lifecycle_stage {
                LifecycleStage::Created => {
                    store
                        .external_tasks
                        .apply(&account, &|mut external: ExternalTaskMetadata| {
                            if external
                                .lifecycle_stage
                                .can_transition_to(LifecycleStage::Active)
                            {
                                external.lifecycle_stage = LifecycleStage::Active;
                            }
                            Ok(external)
                        })
                        .await?;
                    info!("账户 {} 的外部任务已激活", account);
                    activated.push(account);
                }
                LifecycleStage::Active => {}
                LifecycleStage::Paused => warn!("账户 {} 的外部任务已暂停, 跳过", account),
                LifecycleStage::Deprecated => {
                    if let Err(e) = self.ctx.tables.delete_local_table(&account).await {
                        error!("删除账户 {} 的本地表失败: {}", account, e);
                        continue;
                    }
                    store.external_tasks.delete(&account).await?;
                    info!("账户 {} 已下线, 删除本地表和外部任务", account);
                    removed.push(account);
                }
            }
        }
        Ok((activated, removed))
    }
}
