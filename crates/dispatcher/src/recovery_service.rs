use std::time::Instant;

use async_trait::async_trait;
use billing_core::models::{
    ensure_iteration, CopyHistoryStatus, InternalTaskMetadata, InternalTaskState, JobStatus,
    ManagerMetadata, ManagerState,
};
use billing_core::{AppConfig, PipelineError, PipelineResult};
use billing_domain::{
    copy_to_unified_prefix, ManagerKind, PipelineContext, Transactor, PIPELINE_LOCATION,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::cancellation::CancellationScope;
use crate::downstream;
use crate::lease;
use crate::supervisor::JobSupervisor;

/// 恢复服务配置
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// 恢复阶梯最多执行的步数
    pub step_budget: u32,
    /// 恢复标记的有效期, 过期后另一个进程可以接手
    pub recovering_ttl: Duration,
    /// 取消汇总作业后额外等待的时间
    pub cancel_budget: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            step_budget: 16,
            recovering_ttl: Duration::minutes(30),
            cancel_budget: Duration::minutes(5),
        }
    }
}

impl RecoveryConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            step_budget: config.internal_manager.recovery_step_budget,
            recovering_ttl: config.internal_manager.recovering_ttl(),
            cancel_budget: config.supervisor.cancel_budget(),
        }
    }
}

/// 恢复服务接口
#[async_trait]
pub trait RecoveryService: Send + Sync {
    /// 上一轮失败, 或者没有结束且租约过期时, 沿恢复阶梯把内部管理器推进到 `Done`
    ///
    /// 阶梯没有走到 `Done` 时返回 `RecoveryIncomplete`, 调用方不能继续认领新周期。
    async fn general_recovery(&self) -> PipelineResult<RecoveryReport>;

    /// 处理周期开始时遗留的任务, 返回被修改的账户
    async fn single_recovery(&self) -> PipelineResult<Vec<String>>;
}

/// 恢复报告
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub iteration: i64,
    /// 开始恢复时的状态, 不需要恢复时为 `None`
    pub started_from: Option<ManagerState>,
    /// 依次经过的状态
    pub steps: Vec<ManagerState>,
    pub final_state: Option<ManagerState>,
    pub recovery_duration_ms: u64,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    pub fn skipped(iteration: i64) -> Self {
        Self {
            iteration,
            ..Default::default()
        }
    }

    pub fn ran(&self) -> bool {
        self.started_from.is_some()
    }
}

/// 内部管理器的恢复服务实现
pub struct ManagerRecoveryService {
    ctx: PipelineContext,
    supervisor: JobSupervisor,
    config: RecoveryConfig,
}

impl ManagerRecoveryService {
    pub fn new(ctx: PipelineContext, config: Option<RecoveryConfig>) -> Self {
        let config = config.unwrap_or_else(|| RecoveryConfig::from_app_config(&ctx.config));
        let supervisor = JobSupervisor::from_context(&ctx);
        Self {
            ctx,
            supervisor,
            config,
        }
    }

    /// 标记恢复开始, 另一个恢复仍在有效期内时拒绝
    async fn claim(&self, iteration: i64, now: DateTime<Utc>) -> PipelineResult<DateTime<Utc>> {
        let recovering_ttl = now + self.config.recovering_ttl;
        lease::update_manager(
            &self.ctx.store,
            ManagerKind::Internal,
            iteration,
            move |manager| {
                if manager.recovery.in_progress(now) {
                    return Err(PipelineError::RecoveryInProgress);
                }
                manager.recovery.recovering = true;
                manager.recovery.recovering_ttl = Some(recovering_ttl);
                manager.recovery.iteration = manager.iteration;
                Ok(())
            },
        )
        .await?;
        Ok(recovering_ttl)
    }

    async fn release(&self, iteration: i64) -> PipelineResult<()> {
        lease::update_manager(&self.ctx.store, ManagerKind::Internal, iteration, |manager| {
            manager.recovery.recovering = false;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// 执行恢复阶梯的一级, 返回下一个状态
    async fn step(
        &self,
        manager: &ManagerMetadata,
        scope: &CancellationScope,
    ) -> PipelineResult<ManagerState> {
        let iteration = manager.iteration;
        let next = match manager.state {
            ManagerState::Failed => {
                self.drop_tmp_table(iteration).await;
                let failed = self.fail_verified_tasks(iteration).await?;
                info!("迭代 {} 的 {} 个已验证任务标记为失败", iteration, failed);
                ManagerState::Done
            }
            ManagerState::Notified => {
                let completed = downstream::complete_notified_tasks(&self.ctx, iteration).await?;
                debug!("迭代 {} 完成 {} 个已通知任务", iteration, completed.len());
                self.drop_tmp_table(iteration).await;
                ManagerState::Done
            }
            ManagerState::CopiedToUnified => {
                let report = downstream::notify_all(&self.ctx, iteration).await?;
                for (account, e) in &report.failed {
                    warn!("恢复时通知账户 {} 失败: {}", account, e);
                }
                ManagerState::Notified
            }
            ManagerState::Marked => self.resume_aggregate_job(manager, scope).await?,
            ManagerState::Done => ManagerState::Done,
            earlier => {
                warn!("迭代 {} 停在 {}, 汇总作业尚未提交, 标记为失败", iteration, earlier);
                ManagerState::Failed
            }
        };
        lease::advance(&self.ctx.store, ManagerKind::Internal, iteration, next).await?;
        Ok(next)
    }

    /// 汇总作业已提交但结果未确认: 找回作业ID并重新监督
    async fn resume_aggregate_job(
        &self,
        manager: &ManagerMetadata,
        scope: &CancellationScope,
    ) -> PipelineResult<ManagerState> {
        let iteration = manager.iteration;
        let Some(job) = manager.aggregate_job.clone() else {
            warn!("迭代 {} 缺少汇总作业", iteration);
            return Ok(ManagerState::Failed);
        };

        let job_id = match job.job_id.clone().filter(|id| !id.is_empty()) {
            Some(job_id) => job_id,
            None => {
                let prefix = copy_to_unified_prefix(iteration);
                match self.ctx.warehouse.find_by_prefix(&prefix).await? {
                    Some(job_id) => {
                        info!("按前缀 {} 找回汇总作业 {}", prefix, job_id);
                        job_id
                    }
                    None => {
                        info!("没有找到前缀为 {} 的汇总作业", prefix);
                        return Ok(ManagerState::Failed);
                    }
                }
            }
        };

        // 已经超过截止时间的作业直接进入取消确认
        let now = Utc::now();
        let must_finish_by = job.wait_to_finish_timeout.unwrap_or(now).max(now);
        let outcome = self
            .supervisor
            .supervise(
                &job_id,
                PIPELINE_LOCATION,
                must_finish_by,
                self.config.cancel_budget,
                scope,
            )
            .await;

        let status = outcome.job_status();
        let recorded = job_id.clone();
        lease::update_manager(&self.ctx.store, ManagerKind::Internal, iteration, move |m| {
            let job = m.aggregate_job.get_or_insert_with(Default::default);
            job.job_id = Some(recorded.clone());
            job.status = status;
            Ok(())
        })
        .await?;

        if outcome.is_committed() {
            Ok(ManagerState::CopiedToUnified)
        } else {
            warn!("汇总作业 {} 未完成: {}", job_id, outcome.label());
            Ok(ManagerState::Failed)
        }
    }

    async fn drop_tmp_table(&self, iteration: i64) {
        if let Err(e) = self.ctx.tables.drop_tmp_table(iteration).await {
            debug!("删除迭代 {} 的临时表: {}", iteration, e);
        }
    }

    async fn fail_verified_tasks(&self, iteration: i64) -> PipelineResult<usize> {
        let mut failed = 0;
        for (account, task) in self.ctx.store.internal_tasks.list().await? {
            if task.state != InternalTaskState::Verified || task.iteration != iteration {
                continue;
            }
            self.ctx
                .store
                .internal_tasks
                .apply(&account, &|mut current: InternalTaskMetadata| {
                    ensure_iteration(iteration, current.iteration)?;
                    if current.state == InternalTaskState::Verified {
                        current.state = InternalTaskState::Failed;
                    }
                    Ok(current)
                })
                .await?;
            failed += 1;
        }
        Ok(failed)
    }
}

#[async_trait]
impl RecoveryService for ManagerRecoveryService {
    #[instrument(skip(self), fields(manager = "internal"))]
    async fn general_recovery(&self) -> PipelineResult<RecoveryReport> {
        let started = Instant::now();
        let now = Utc::now();
        let manager = lease::ensure_manager(&self.ctx.store, ManagerKind::Internal).await?;
        let iteration = manager.iteration;

        if manager.state == ManagerState::Done {
            return Ok(RecoveryReport::skipped(iteration));
        }
        if !manager.state.is_terminal() && !manager.lease().is_expired(now) {
            debug!("迭代 {} 仍在有效期内 ({}), 不恢复", iteration, manager.state);
            return Ok(RecoveryReport::skipped(iteration));
        }

        info!("开始恢复内部管理器迭代 {} (状态 {})", iteration, manager.state);
        let recovering_ttl = self.claim(iteration, now).await?;
        let scope = CancellationScope::until(recovering_ttl);
        let mut report = RecoveryReport {
            iteration,
            started_from: Some(manager.state),
            ..Default::default()
        };

        let mut steps = 0;
        let mut state = manager.state;
        while state != ManagerState::Done {
            if steps >= self.config.step_budget || scope.is_cancelled() {
                warn!("迭代 {} 的恢复在 {} 停止, 已执行 {} 步", iteration, state, steps);
                break;
            }
            let current = self.ctx.store.manager(ManagerKind::Internal).await?;
            match self.step(&current, &scope).await {
                Ok(next) => {
                    report.steps.push(next);
                    state = next;
                }
                Err(e) => {
                    error!("恢复迭代 {} 的 {} 状态失败: {}", iteration, state, e);
                    report.errors.push(e.to_string());
                    break;
                }
            }
            steps += 1;
        }

        self.release(iteration).await?;
        report.final_state = Some(state);
        report.recovery_duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "内部管理器迭代 {} 恢复结束: {} -> {}",
            iteration, manager.state, state
        );
        if state != ManagerState::Done {
            return Err(PipelineError::RecoveryIncomplete {
                iteration,
                state: state.to_string(),
            });
        }
        Ok(report)
    }

    async fn single_recovery(&self) -> PipelineResult<Vec<String>> {
        let manager = lease::ensure_manager(&self.ctx.store, ManagerKind::Internal).await?;
        // 已验证的任务只有在上一轮走完恢复阶梯后才能视为已拷贝
        if manager.state != ManagerState::Done {
            debug!("内部管理器处于 {}, 跳过遗留任务处理", manager.state);
            return Ok(Vec::new());
        }

        let mut recovered = Vec::new();
        for (account, task) in self.ctx.store.internal_tasks.list().await? {
            let target = match task.state {
                InternalTaskState::Pending | InternalTaskState::Running => InternalTaskState::Failed,
                InternalTaskState::Verified | InternalTaskState::Notified => InternalTaskState::Done,
                _ => continue,
            };
            let held = task.state;
            let result = self
                .ctx
                .store
                .internal_tasks
                .apply(&account, &|mut current: InternalTaskMetadata| {
                    if current.state != held {
                        return Ok(current);
                    }
                    if let Some(job) = current.jobs.from_local_to_tmp.as_mut() {
                        if target == InternalTaskState::Failed && !job.status.is_done() {
                            job.status = JobStatus::Failed;
                        }
                    }
                    if target == InternalTaskState::Done
                        && current.copy_history.status == CopyHistoryStatus::Notified
                    {
                        current.copy_history.status = CopyHistoryStatus::Done;
                    }
                    current.state = target;
                    Ok(current)
                })
                .await;
            match result {
                Ok(_) => {
                    warn!("账户 {} 的遗留任务 {} -> {}", account, held, target);
                    recovered.push(account);
                }
                Err(e) => error!("恢复账户 {} 的遗留任务失败: {}", account, e),
            }
        }
        Ok(recovered)
    }
}
