use billing_core::models::{
    InternalTaskMetadata, InternalTaskState, LifecycleStage, ReconciliationCheckpoint, Segment,
};
use billing_core::PipelineResult;
use billing_domain::{BillingCopy, PipelineContext, Resolution, Transactor};
use chrono::{DateTime, Duration, Months, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use super::alerts;
use super::{ReconciliationEngine, ReconciliationResult};
use crate::metrics;
use crate::notifications::send_alert;

/// 单个账户一次监控的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub billing_account_id: String,
    /// 账户当前不允许对账
    pub skipped: bool,
    pub window: Option<Segment>,
    pub mismatches: usize,
    pub failed_queries: usize,
    pub fresh: bool,
    pub recent_data: bool,
}

/// 账户处于接入中、没有时间段或已下线时不对账
pub fn monitor_allowed(task: &InternalTaskMetadata) -> bool {
    !task.onboarding
        && task.segment.is_some()
        && task.lifecycle_stage != LifecycleStage::Deprecated
}

/// 最近一次写入统一表的时间点之前的若干个月
pub fn default_window(task: &InternalTaskMetadata, months: u32) -> Option<Segment> {
    let segment = task.segment?;
    let last_updated = match task.state {
        InternalTaskState::Done | InternalTaskState::Skipped => segment.end_time,
        _ => segment.start_time,
    };
    let start = last_updated
        .checked_sub_months(Months::new(months))
        .unwrap_or(last_updated - Duration::days(31 * i64::from(months)));
    Some(Segment::new(start, last_updated))
}

/// 定期对账与全量检查
pub struct ReconciliationMonitor {
    ctx: PipelineContext,
    engine: ReconciliationEngine,
}

impl ReconciliationMonitor {
    pub fn new(ctx: PipelineContext) -> Self {
        let engine = ReconciliationEngine::new(
            ctx.tables.clone(),
            ctx.config.reconciliation.queries_per_minute,
            ctx.config.internal_manager.master_account_id.clone(),
        );
        Self { ctx, engine }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    /// 对一个账户执行默认窗口的对账, 并检查数据新鲜度
    #[instrument(skip(self))]
    pub async fn run_monitor(&self, billing_account_id: &str) -> PipelineResult<MonitorReport> {
        let cfg = &self.ctx.config;
        let task = self.ctx.store.internal_tasks.get(billing_account_id).await?;
        let mut report = MonitorReport {
            billing_account_id: billing_account_id.to_string(),
            ..Default::default()
        };
        let window = match default_window(&task, cfg.reconciliation.default_window_months) {
            Some(window) if monitor_allowed(&task) => window,
            _ => {
                info!("账户 {} 当前不允许对账", billing_account_id);
                report.skipped = true;
                return Ok(report);
            }
        };
        report.window = Some(window);

        let result = self.engine.reconcile(billing_account_id, window).await?;
        report.mismatches = result.mismatches.len();
        report.failed_queries = result.failed_queries.len();
        self.alert_on(&result).await;

        let now = Utc::now();
        report.fresh = self.check_freshness(billing_account_id, now).await;
        report.recent_data = self.check_past_week(billing_account_id, now).await;

        let checkpoint = ReconciliationCheckpoint {
            billing_account_id: billing_account_id.to_string(),
            last_validated: Some(window.end_time),
            last_mismatch_count: result.mismatches.len(),
            last_update: None,
        };
        self.ctx
            .store
            .checkpoints
            .set(billing_account_id, checkpoint)
            .await?;
        metrics::record_mismatches(result.mismatches.len());

        info!(
            "账户 {} 对账完成: {} 个不一致, {} 个失败查询, 新鲜 {}, 近一周有数据 {}",
            billing_account_id,
            report.mismatches,
            report.failed_queries,
            report.fresh,
            report.recent_data
        );
        Ok(report)
    }

    /// 从每个活跃账户最早的一行开始做全量对账
    #[instrument(skip(self))]
    pub async fn sanity_check_all(&self) -> PipelineResult<Vec<ReconciliationResult>> {
        let now = Utc::now();
        let mut results = Vec::new();
        for (account, task) in self.ctx.store.internal_tasks.list().await? {
            if task.onboarding || task.lifecycle_stage != LifecycleStage::Active {
                continue;
            }
            let origin = if self.ctx.is_master(&account) {
                BillingCopy::Raw
            } else {
                BillingCopy::Source
            };
            let oldest = match self.ctx.tables.oldest_record_time(origin, &account).await {
                Ok(oldest) => oldest,
                Err(e) if e.is_empty_table() => {
                    info!("账户 {} 没有数据, 跳过全量检查", account);
                    continue;
                }
                Err(e) => {
                    error!("读取账户 {} 最早的数据失败: {}", account, e);
                    continue;
                }
            };

            let window = Segment::new(Resolution::Month.truncate(oldest), now);
            match self.engine.reconcile(&account, window).await {
                Ok(result) => {
                    metrics::record_mismatches(result.mismatches.len());
                    self.alert_on(&result).await;
                    results.push(result);
                }
                Err(e) => error!("账户 {} 全量检查失败: {}", account, e),
            }
        }
        Ok(results)
    }

    async fn alert_on(&self, result: &ReconciliationResult) {
        let cfg = &self.ctx.config.notifications;
        if !result.mismatches.is_empty() {
            warn!(
                "账户 {} 有 {} 个不一致时间段",
                result.billing_account_id,
                result.mismatches.len()
            );
            send_alert(self.ctx.notifier.as_ref(), alerts::mismatches(cfg, result)).await;
        }
        if !result.failed_queries.is_empty() {
            send_alert(self.ctx.notifier.as_ref(), alerts::queries_failed(cfg, result)).await;
        }
    }

    async fn check_freshness(&self, billing_account_id: &str, now: DateTime<Utc>) -> bool {
        let cfg = &self.ctx.config;
        let newest = match self
            .ctx
            .tables
            .newest_record_time(BillingCopy::Unified, billing_account_id)
            .await
        {
            Ok(newest) => Some(newest),
            Err(e) if e.is_empty_table() => None,
            Err(e) => {
                error!("读取账户 {} 最新数据时间失败: {}", billing_account_id, e);
                return false;
            }
        };
        let fresh = newest.is_some_and(|t| now - t <= cfg.reconciliation.allowed_delay());
        if !fresh {
            send_alert(
                self.ctx.notifier.as_ref(),
                alerts::stale_data(
                    &cfg.notifications,
                    billing_account_id,
                    newest,
                    cfg.reconciliation.allowed_delay_hours,
                ),
            )
            .await;
        }
        fresh
    }

    async fn check_past_week(&self, billing_account_id: &str, now: DateTime<Utc>) -> bool {
        let week = Segment::new(now - Duration::days(7), now);
        let present = match self
            .engine
            .count_rows(BillingCopy::Unified, billing_account_id, &week, Resolution::Day)
            .await
        {
            Ok(counts) => counts.values().any(|count| *count > 0),
            Err(e) => {
                error!("统计账户 {} 近一周数据失败: {}", billing_account_id, e);
                false
            }
        };
        if !present {
            send_alert(
                self.ctx.notifier.as_ref(),
                alerts::no_recent_data(&self.ctx.config.notifications, billing_account_id, &week),
            )
            .await;
        }
        present
    }
}
