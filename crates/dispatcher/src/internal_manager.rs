//! 内部管理器
//!
//! 每个周期先执行恢复, 然后认领管理器并依次: 创建临时表 → 刷新任务 → 分发工作器
//! → 等待拷贝作业 → 汇总到统一表 → 下游通知 → 生命周期处理 → 收尾。
//! 每完成一步都把状态写回管理器文档, 进程崩溃后由恢复阶梯从最后的状态继续。

use std::sync::Arc;

use billing_core::models::{
    ensure_iteration, InternalTaskMetadata, InternalTaskState, Job, JobStatus, LifecycleStage,
    ManagerState,
};
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{
    copy_to_unified_prefix, delete_from_unified_prefix, paths, BillingEvent, JobKind, JobSpec,
    ManagerKind, PipelineContext, StageRequest, TaskRequest, Transactor, PIPELINE_LOCATION,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::cancellation::CancellationScope;
use crate::downstream;
use crate::fanout::fan_out;
use crate::internal_task::{needs_segment, source_copy, update_internal_task, InternalInput};
use crate::lease;
use crate::metrics;
use crate::notifications::{self, send_alert};
use crate::recovery_service::{ManagerRecoveryService, RecoveryReport, RecoveryService};
use crate::segment::load_next_segment;
use crate::supervisor::{JobOutcome, JobSupervisor, Observation};

/// 一个内部周期的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InternalCycleReport {
    pub iteration: i64,
    pub recovery: RecoveryReport,
    pub orphans: Vec<String>,
    pub updated: Vec<String>,
    pub dispatched: Vec<String>,
    pub verified: Vec<String>,
    pub failed: Vec<String>,
    pub copied_to_unified: bool,
    pub notified: Vec<String>,
    pub activated: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Clone)]
pub struct InternalManager {
    ctx: PipelineContext,
    supervisor: JobSupervisor,
    recovery: Arc<dyn RecoveryService>,
}

impl InternalManager {
    pub fn new(ctx: PipelineContext) -> Self {
        let recovery = Arc::new(ManagerRecoveryService::new(ctx.clone(), None));
        Self::with_recovery(ctx, recovery)
    }

    pub fn with_recovery(ctx: PipelineContext, recovery: Arc<dyn RecoveryService>) -> Self {
        let supervisor = JobSupervisor::from_context(&ctx);
        Self {
            ctx,
            supervisor,
            recovery,
        }
    }

    /// 执行一个完整周期
    #[instrument(skip(self), fields(manager = "internal"))]
    pub async fn run_cycle(&self) -> PipelineResult<InternalCycleReport> {
        let recovery = match self.recovery.general_recovery().await {
            Ok(recovery) => recovery,
            Err(e) => {
                warn!("内部管理器恢复没有完成, 跳过本轮: {}", e);
                metrics::record_cycle("internal", "rejected");
                return Err(e);
            }
        };
        let orphans = self.recovery.single_recovery().await?;

        let cfg = &self.ctx.config.internal_manager;
        let now = Utc::now();
        let manager =
            match lease::catch(&self.ctx.store, ManagerKind::Internal, cfg.ttl(), now).await {
                Ok(manager) => manager,
                Err(e) => {
                    warn!("内部管理器无法开始新周期: {}", e);
                    metrics::record_cycle("internal", "rejected");
                    return Err(e);
                }
            };
        let iteration = manager.iteration;
        let scope = CancellationScope::until(manager.ttl.unwrap_or(now + cfg.ttl()));

        let mut report = InternalCycleReport {
            iteration,
            recovery,
            orphans,
            ..Default::default()
        };
        match self.drive(iteration, &scope, &mut report).await {
            Ok(()) => {
                info!(
                    "内部管理器迭代 {} 完成: 验证 {} 个账户, 失败 {} 个",
                    iteration,
                    report.verified.len(),
                    report.failed.len()
                );
                metrics::record_cycle("internal", "done");
                Ok(report)
            }
            Err(e) => {
                error!("内部管理器迭代 {} 失败: {}", iteration, e);
                self.fail_before_aggregate(iteration).await;
                send_alert(
                    self.ctx.notifier.as_ref(),
                    notifications::cycle_failed(
                        &self.ctx.config.notifications,
                        ManagerKind::Internal,
                        iteration,
                        &e,
                    ),
                )
                .await;
                metrics::record_cycle("internal", "failed");
                Err(e)
            }
        }
    }

    /// 汇总作业提交之前中断的周期直接标记为失败, 下一轮由恢复阶梯清理。
    /// 从 `Marked` 开始统一表可能已经写入, 保持原状态交给恢复阶梯判断。
    async fn fail_before_aggregate(&self, iteration: i64) {
        let result = lease::update_manager(
            &self.ctx.store,
            ManagerKind::Internal,
            iteration,
            |manager| {
                if manager.state < ManagerState::Marked {
                    manager.state = ManagerState::Failed;
                }
                Ok(())
            },
        )
        .await;
        match result {
            Ok(manager) => debug!("内部管理器迭代 {} 停在 {}", iteration, manager.state),
            Err(e) => error!("标记内部管理器失败状态出错: {}", e),
        }
    }

    async fn advance(&self, iteration: i64, state: ManagerState) -> PipelineResult<()> {
        lease::advance(&self.ctx.store, ManagerKind::Internal, iteration, state).await?;
        Ok(())
    }

    async fn drive(
        &self,
        iteration: i64,
        scope: &CancellationScope,
        report: &mut InternalCycleReport,
    ) -> PipelineResult<()> {
        let tmp_table = self.ctx.tables.create_tmp_table(iteration).await?;
        self.advance(iteration, ManagerState::TmpTableCreated).await?;

        report.updated = self.update_tasks(iteration).await?;
        self.advance(iteration, ManagerState::TasksUpdated).await?;

        report.dispatched = self.dispatch_workers(iteration).await?;
        self.advance(iteration, ManagerState::TasksCreated).await?;

        let (verified, failed) = self.wait_until_tasks_done(iteration, scope).await?;
        report.verified = verified;
        report.failed = failed;
        let cfg = self.ctx.config.internal_manager.clone();
        let now = Utc::now();
        lease::update_manager(
            &self.ctx.store,
            ManagerKind::Internal,
            iteration,
            move |manager| {
                manager.aggregate_job =
                    Some(Job::armed(now, cfg.wait_to_start(), cfg.task_max_duration()));
                manager.state = ManagerState::TasksDone;
                Ok(())
            },
        )
        .await?;

        report.copied_to_unified = self
            .copy_to_unified(iteration, &tmp_table, &report.verified, scope)
            .await?;

        let notified = downstream::notify_all(&self.ctx, iteration).await?;
        if let Some((account, e)) = notified.failed.into_iter().next() {
            return Err(PipelineError::internal(format!("通知账户 {account} 失败: {e}")));
        }
        report.notified = notified
            .succeeded
            .into_iter()
            .map(|(account, _)| account)
            .collect();
        self.advance(iteration, ManagerState::Notified).await?;

        match self.handle_lifecycle_changes().await {
            Ok((activated, removed)) => {
                report.activated = activated;
                report.removed = removed;
            }
            Err(e) => error!("内部任务生命周期处理失败: {}", e),
        }

        self.tear_down(iteration).await
    }

    /// 刷新所有活跃账户的任务
    async fn update_tasks(&self, iteration: i64) -> PipelineResult<Vec<String>> {
        let accounts: Vec<String> = self
            .ctx
            .store
            .internal_tasks
            .list()
            .await?
            .into_iter()
            .filter(|(_, task)| task.lifecycle_stage == LifecycleStage::Active)
            .map(|(account, _)| account)
            .collect();

        let this = self.clone();
        let updated = fan_out(accounts, move |account| {
            let this = this.clone();
            async move { this.update_task(&account, iteration).await }
        })
        .await;
        if !updated.is_clean() {
            warn!(
                "内部管理器迭代 {} 只刷新了 {}/{} 个账户",
                iteration,
                updated.succeeded.len(),
                updated.total()
            );
        }
        self.report_account_errors(iteration, &updated.failed).await;
        Ok(updated
            .succeeded
            .into_iter()
            .map(|(account, _)| account)
            .collect())
    }

    async fn update_task(
        &self,
        billing_account_id: &str,
        iteration: i64,
    ) -> PipelineResult<InternalTaskState> {
        let store = &self.ctx.store;
        let task = store.internal_tasks.get(billing_account_id).await?;
        let copy = source_copy(self.ctx.is_master(billing_account_id));
        let mut input = InternalInput::default();
        if needs_segment(&task) {
            input.next_segment = load_next_segment(
                self.ctx.tables.as_ref(),
                copy,
                billing_account_id,
                task.segment.as_ref(),
                self.ctx.config.internal_manager.segment_cap_months,
            )
            .await?;
        } else if task.state == InternalTaskState::Skipped {
            input.newest = match self
                .ctx
                .tables
                .newest_record_time(copy, billing_account_id)
                .await
            {
                Ok(newest) => Some(newest),
                Err(e) if e.is_empty_table() => None,
                Err(e) => return Err(e),
            };
        }

        let now = Utc::now();
        let cfg = self.ctx.config.internal_manager.clone();
        let (held_iteration, held_state) = (task.iteration, task.state);
        let result = store
            .internal_tasks
            .apply(billing_account_id, &|current: InternalTaskMetadata| {
                ensure_iteration(held_iteration, current.iteration)?;
                if current.state != held_state {
                    return Ok(current);
                }
                update_internal_task(current, &input, iteration, now, &cfg)
            })
            .await;

        match result {
            Ok(updated) => {
                if updated.state != held_state {
                    debug!(
                        "账户 {} 内部任务 {} -> {}",
                        billing_account_id, held_state, updated.state
                    );
                }
                Ok(updated.state)
            }
            Err(PipelineError::InvalidMetadataState(msg)) => {
                error!("账户 {} 内部任务元数据无效: {}", billing_account_id, msg);
                self.fail_task(billing_account_id, held_iteration, None).await?;
                Err(PipelineError::InvalidMetadataState(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// 为本轮 `Pending` 的任务分发工作器
    async fn dispatch_workers(&self, iteration: i64) -> PipelineResult<Vec<String>> {
        let mut dispatched = Vec::new();
        for (account, task) in self.ctx.store.internal_tasks.list().await? {
            if task.state != InternalTaskState::Pending || task.iteration != iteration {
                continue;
            }
            let body = serde_json::to_value(StageRequest {
                billing_account_id: account.clone(),
                iteration,
            })?;
            let request = TaskRequest::post(
                &self.ctx.config.queues.internal_tasks,
                paths::INTERNAL_TASK,
                body,
            );
            match self.ctx.queue.enqueue(request).await {
                Ok(()) => dispatched.push(account),
                Err(e) => {
                    error!("分发账户 {} 的内部任务失败: {}", account, e);
                    self.fail_task(&account, iteration, None).await?;
                }
            }
        }
        info!("迭代 {} 分发 {} 个内部任务", iteration, dispatched.len());
        Ok(dispatched)
    }

    /// 等待所有分发的拷贝作业, 返回 (已验证, 失败) 的账户
    async fn wait_until_tasks_done(
        &self,
        iteration: i64,
        scope: &CancellationScope,
    ) -> PipelineResult<(Vec<String>, Vec<String>)> {
        let accounts: Vec<String> = self
            .ctx
            .store
            .internal_tasks
            .list()
            .await?
            .into_iter()
            .filter(|(_, task)| {
                task.iteration == iteration
                    && matches!(
                        task.state,
                        InternalTaskState::Pending | InternalTaskState::Running
                    )
            })
            .map(|(account, _)| account)
            .collect();

        let this = self.clone();
        let scope = scope.clone();
        let waited = fan_out(accounts, move |account| {
            let this = this.clone();
            let scope = scope.clone();
            async move { this.wait_for_task(&account, iteration, &scope).await }
        })
        .await;

        let mut verified = Vec::new();
        let mut failed = Vec::new();
        for (account, state) in waited.succeeded {
            if state == InternalTaskState::Verified {
                verified.push(account);
            } else {
                failed.push(account);
            }
        }
        for (account, e) in &waited.failed {
            warn!("等待账户 {} 的拷贝作业出错: {}", account, e);
            failed.push(account.clone());
        }
        self.report_account_errors(iteration, &waited.failed).await;
        verified.sort();
        failed.sort();
        Ok((verified, failed))
    }

    async fn wait_for_task(
        &self,
        billing_account_id: &str,
        iteration: i64,
        scope: &CancellationScope,
    ) -> PipelineResult<InternalTaskState> {
        let store = &self.ctx.store;
        let (job_id, finish_by) = loop {
            let task = store.internal_tasks.get(billing_account_id).await?;
            ensure_iteration(iteration, task.iteration)?;
            let job = task.jobs.from_local_to_tmp.clone().ok_or_else(|| {
                PipelineError::invalid_state(format!("账户 {billing_account_id} 缺少拷贝作业"))
            })?;
            let (start_by, finish_by) = job.deadlines()?;
            if let Some(job_id) = job.job_id.filter(|id| !id.is_empty()) {
                break (job_id, finish_by);
            }
            if scope.is_cancelled() || Utc::now() > start_by {
                warn!("账户 {} 的拷贝作业未按时启动", billing_account_id);
                self.fail_task(billing_account_id, iteration, Some(JobStatus::ScheduleTimeout))
                    .await?;
                return Ok(InternalTaskState::Failed);
            }
            self.supervisor.pause(&scope.with_deadline(start_by)).await;
        };

        let outcome = self
            .supervisor
            .supervise(
                &job_id,
                PIPELINE_LOCATION,
                finish_by,
                self.ctx.config.supervisor.cancel_budget(),
                scope,
            )
            .await;
        let state = if outcome.is_committed() {
            InternalTaskState::Verified
        } else {
            InternalTaskState::Failed
        };
        let status = outcome.job_status();
        store
            .internal_tasks
            .apply(billing_account_id, &|mut task: InternalTaskMetadata| {
                ensure_iteration(iteration, task.iteration)?;
                if let Some(job) = task.jobs.from_local_to_tmp.as_mut() {
                    job.status = status;
                }
                task.state = state;
                Ok(task)
            })
            .await?;
        Ok(state)
    }

    /// 把已验证账户的数据从临时表拷贝到统一表, 返回是否执行了拷贝
    async fn copy_to_unified(
        &self,
        iteration: i64,
        tmp_table: &str,
        verified: &[String],
        scope: &CancellationScope,
    ) -> PipelineResult<bool> {
        if verified.is_empty() {
            info!("迭代 {} 没有已验证的任务, 跳过汇总", iteration);
            self.advance(iteration, ManagerState::CopiedToUnified).await?;
            return Ok(false);
        }

        let spec = JobSpec {
            job_prefix: copy_to_unified_prefix(iteration),
            location: PIPELINE_LOCATION.to_string(),
            kind: JobKind::CopyTmpToUnified {
                tmp_table: tmp_table.to_string(),
                billing_account_ids: verified.to_vec(),
            },
        };
        let job_id = match self.ctx.warehouse.run(&spec).await {
            Ok(job_id) => job_id,
            Err(e) => {
                lease::mark_failed(&self.ctx.store, ManagerKind::Internal, iteration).await?;
                return Err(e);
            }
        };

        let recorded = job_id.clone();
        let manager = lease::update_manager(
            &self.ctx.store,
            ManagerKind::Internal,
            iteration,
            move |manager| {
                let job = manager.aggregate_job.as_mut().ok_or_else(|| {
                    PipelineError::invalid_state("汇总作业没有布置")
                })?;
                job.record_started(recorded.clone());
                manager.state = ManagerState::Marked;
                Ok(())
            },
        )
        .await?;
        let finish_by = manager
            .aggregate_job
            .as_ref()
            .ok_or_else(|| PipelineError::invalid_state("汇总作业没有布置"))?
            .deadlines()?
            .1;

        let outcome = self
            .supervisor
            .supervise(
                &job_id,
                PIPELINE_LOCATION,
                finish_by,
                self.ctx.config.supervisor.cancel_budget(),
                scope,
            )
            .await;
        let status = outcome.job_status();
        let committed = outcome.is_committed();
        lease::update_manager(
            &self.ctx.store,
            ManagerKind::Internal,
            iteration,
            move |manager| {
                if let Some(job) = manager.aggregate_job.as_mut() {
                    job.status = status;
                }
                manager.state = if committed {
                    ManagerState::CopiedToUnified
                } else {
                    ManagerState::Failed
                };
                Ok(())
            },
        )
        .await?;

        if !committed {
            let cause = match outcome {
                JobOutcome::Failed(cause) => cause,
                other => other.label().to_string(),
            };
            return Err(PipelineError::JobExecutionFailure { job_id, cause });
        }
        info!("迭代 {} 的 {} 个账户已拷贝到统一表", iteration, verified.len());
        Ok(true)
    }

    /// 生命周期处理, 返回 (激活的账户, 删除的账户)
    async fn handle_lifecycle_changes(&self) -> PipelineResult<(Vec<String>, Vec<String>)> {
        let mut activated = Vec::new();
        let mut removed = Vec::new();
        for (account, task) in self.ctx.store.internal_tasks.list().await? {
            match task.lifecycle_stage {
                LifecycleStage::Created if !task.onboarding => {
                    self.ctx
                        .store
                        .internal_tasks
                        .apply(&account, &|mut current: InternalTaskMetadata| {
                            if current
                                .lifecycle_stage
                                .can_transition_to(LifecycleStage::Active)
                                && !current.onboarding
                            {
                                current.lifecycle_stage = LifecycleStage::Active;
                            }
                            Ok(current)
                        })
                        .await?;
                    info!("账户 {} 的内部任务已激活", account);
                    activated.push(account);
                }
                LifecycleStage::Paused => warn!("账户 {} 的内部任务已暂停, 跳过", account),
                LifecycleStage::Deprecated => match self.drain_deprecated(&task).await {
                    Ok(true) => removed.push(account),
                    Ok(false) => {}
                    Err(e) => error!("下线账户 {} 失败: {}", account, e),
                },
                _ => {}
            }
        }
        Ok((activated, removed))
    }

    /// 从统一表删除已下线账户的数据, 完成后删除任务文档
    async fn drain_deprecated(&self, task: &InternalTaskMetadata) -> PipelineResult<bool> {
        let account = &task.billing_account_id;
        let store = &self.ctx.store;
        let delete_job = task
            .jobs
            .delete_from_unified
            .as_ref()
            .and_then(|job| job.job_id.clone().filter(|id| !id.is_empty()));

        let Some(job_id) = delete_job else {
            let spec = JobSpec {
                job_prefix: delete_from_unified_prefix(account),
                location: PIPELINE_LOCATION.to_string(),
                kind: JobKind::DeleteFromUnified {
                    billing_account_id: account.clone(),
                },
            };
            let job_id = self.ctx.warehouse.run(&spec).await?;
            let cfg = self.ctx.config.internal_manager.clone();
            let now = Utc::now();
            store
                .internal_tasks
                .apply(account, &|mut current: InternalTaskMetadata| {
                    let mut job = Job::armed(now, cfg.wait_to_start(), cfg.task_max_duration());
                    job.record_started(job_id.clone());
                    current.jobs.delete_from_unified = Some(job);
                    Ok(current)
                })
                .await?;
            info!("提交账户 {} 的统一表删除作业 {}", account, job_id);
            return Ok(false);
        };

        match self.supervisor.observe(&job_id, PIPELINE_LOCATION).await {
            Observation::Done => {
                if !self.ctx.is_master(account) {
                    let end = task.segment.map(|s| s.end_time).unwrap_or_else(Utc::now);
                    let start = task.oldest_partition.unwrap_or(end);
                    self.ctx
                        .events
                        .publish(&BillingEvent::Offboarded {
                            billing_account_id: account.clone(),
                            customer_id: task.customer_id.clone(),
                            start_day: start.date_naive(),
                            end_day: end.date_naive(),
                        })
                        .await?;
                }
                store.internal_tasks.delete(account).await?;
                info!("账户 {} 已从统一表删除, 删除内部任务", account);
                Ok(true)
            }
            Observation::Failed(cause) => {
                warn!("账户 {} 的删除作业失败, 下一轮重新提交: {}", account, cause);
                store
                    .internal_tasks
                    .apply(account, &|mut current: InternalTaskMetadata| {
                        current.jobs.delete_from_unified = None;
                        Ok(current)
                    })
                    .await?;
                Ok(false)
            }
            _ => {
                debug!("账户 {} 的删除作业 {} 仍在运行", account, job_id);
                Ok(false)
            }
        }
    }

    async fn tear_down(&self, iteration: i64) -> PipelineResult<()> {
        if let Err(e) = self.ctx.tables.drop_tmp_table(iteration).await {
            warn!("删除迭代 {} 的临时表失败: {}", iteration, e);
        }
        let completed = downstream::complete_notified_tasks(&self.ctx, iteration).await?;
        debug!("迭代 {} 完成 {} 个任务", iteration, completed.len());
        lease::tear_down(&self.ctx.store, ManagerKind::Internal, iteration).await?;
        Ok(())
    }

    async fn fail_task(
        &self,
        billing_account_id: &str,
        iteration: i64,
        job_status: Option<JobStatus>,
    ) -> PipelineResult<()> {
        self.ctx
            .store
            .internal_tasks
            .apply(billing_account_id, &|mut task: InternalTaskMetadata| {
                ensure_iteration(iteration, task.iteration)?;
                if let (Some(status), Some(job)) = (job_status, task.jobs.from_local_to_tmp.as_mut())
                {
                    job.status = status;
                }
                task.state = InternalTaskState::Failed;
                Ok(task)
            })
            .await?;
        Ok(())
    }

    async fn report_account_errors(&self, iteration: i64, failures: &[(String, PipelineError)]) {
        if failures.is_empty() {
            return;
        }
        send_alert(
            self.ctx.notifier.as_ref(),
            notifications::account_errors(
                &self.ctx.config.notifications,
                ManagerKind::Internal,
                iteration,
                failures,
            ),
        )
        .await;
    }
}
