//! 账户接入与下线
//!
//! 接入按固定顺序执行各个步骤, 每个完成的步骤登记一个补偿动作;
//! 任何一步失败时按相反顺序执行已登记的补偿, 然后返回错误。

use billing_core::models::{
    BillingTableInfo, BucketData, CopyHistory, CopyHistoryStatus, ExternalTaskMetadata,
    ExternalTaskState, InternalTaskMetadata, InternalTaskState, LifecycleStage, ManagerMetadata,
};
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{
    bucket_name, BillingCopy, ImportStatus, ManagerKind, PipelineContext, Transactor,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::notifications::{self, send_alert};
use crate::segment::anchor_empty;

/// 接入请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingRequest {
    pub billing_account_id: String,
    pub customer_id: String,
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    #[serde(default)]
    pub dummy: bool,
}

impl OnboardingRequest {
    fn validate(&self) -> PipelineResult<()> {
        let fields = [
            ("billing_account_id", &self.billing_account_id),
            ("customer_id", &self.customer_id),
            ("project_id", &self.project_id),
            ("dataset_id", &self.dataset_id),
            ("table_id", &self.table_id),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(PipelineError::invalid_state(format!("接入请求缺少字段 {name}")));
        }
        Ok(())
    }

    fn source_table(&self, location: String) -> BillingTableInfo {
        BillingTableInfo {
            project_id: self.project_id.clone(),
            dataset_id: self.dataset_id.clone(),
            table_id: self.table_id.clone(),
            location,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStep {
    CheckInternalAbsent,
    CheckExternalAbsent,
    LocateSourceTable,
    NewestRecord,
    OldestRecord,
    CreateMetadata,
    EnsureBucket,
    CreateLocalTable,
    MarkImportStarted,
}

impl OnboardingStep {
    pub const ALL: [OnboardingStep; 9] = [
        OnboardingStep::CheckInternalAbsent,
        OnboardingStep::CheckExternalAbsent,
        OnboardingStep::LocateSourceTable,
        OnboardingStep::NewestRecord,
        OnboardingStep::OldestRecord,
        OnboardingStep::CreateMetadata,
        OnboardingStep::EnsureBucket,
        OnboardingStep::CreateLocalTable,
        OnboardingStep::MarkImportStarted,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OnboardingStep::CheckInternalAbsent => "check internal task",
            OnboardingStep::CheckExternalAbsent => "check external task",
            OnboardingStep::LocateSourceTable => "locate source table",
            OnboardingStep::NewestRecord => "newest record",
            OnboardingStep::OldestRecord => "oldest record",
            OnboardingStep::CreateMetadata => "create metadata",
            OnboardingStep::EnsureBucket => "ensure bucket",
            OnboardingStep::CreateLocalTable => "create local table",
            OnboardingStep::MarkImportStarted => "mark import started",
        }
    }
}

/// 已完成步骤的补偿动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compensation {
    DeleteMetadata,
    DeleteLocalTable,
    ResetImportStatus,
}

/// 接入结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnboardingReport {
    pub billing_account_id: String,
    pub location: String,
    pub newest: DateTime<Utc>,
    pub oldest: DateTime<Utc>,
    pub completed_steps: Vec<OnboardingStep>,
}

#[derive(Debug, Default)]
struct Progress {
    location: String,
    newest: Option<DateTime<Utc>>,
    oldest: Option<DateTime<Utc>>,
}

pub struct Onboarding {
    ctx: PipelineContext,
}

impl Onboarding {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// 接入一个账户, 失败时回滚已完成的步骤
    #[instrument(skip(self, request), fields(account = %request.billing_account_id))]
    pub async fn onboard(&self, request: &OnboardingRequest) -> PipelineResult<OnboardingReport> {
        request.validate()?;
        let account = request.billing_account_id.as_str();
        if self.ctx.is_master(account) {
            return Err(PipelineError::invalid_state("主账户不能通过接入流程创建"));
        }

        let now = Utc::now();
        let mut progress = Progress::default();
        let mut compensations = Vec::new();
        let mut completed = Vec::new();

        for step in OnboardingStep::ALL {
            match self.run_step(step, request, now, &mut progress).await {
                Ok(compensation) => {
                    compensations.extend(compensation);
                    completed.push(step);
                }
                Err(e) => {
                    error!("账户 {} 接入在步骤 \"{}\" 失败: {}", account, step.name(), e);
                    self.roll_back(account, compensations).await;
                    send_alert(
                        self.ctx.notifier.as_ref(),
                        notifications::onboarding_failed(
                            &self.ctx.config.notifications,
                            account,
                            step.name(),
                            &e,
                        ),
                    )
                    .await;
                    return Err(e);
                }
            }
        }

        info!("账户 {} 接入完成", account);
        Ok(OnboardingReport {
            billing_account_id: account.to_string(),
            location: progress.location,
            newest: progress.newest.unwrap_or(now),
            oldest: progress.oldest.unwrap_or(now),
            completed_steps: completed,
        })
    }

    async fn run_step(
        &self,
        step: OnboardingStep,
        request: &OnboardingRequest,
        now: DateTime<Utc>,
        progress: &mut Progress,
    ) -> PipelineResult<Option<Compensation>> {
        let account = request.billing_account_id.as_str();
        let store = &self.ctx.store;
        let tables = &self.ctx.tables;
        match step {
            OnboardingStep::CheckInternalAbsent => {
                if store.internal_tasks.find(account).await?.is_some() {
                    return Err(PipelineError::AlreadyExists {
                        key: format!("internalTasks/{account}"),
                    });
                }
            }
            OnboardingStep::CheckExternalAbsent => {
                if store.external_tasks.find(account).await?.is_some() {
                    return Err(PipelineError::AlreadyExists {
                        key: format!("externalTasks/{account}"),
                    });
                }
            }
            OnboardingStep::LocateSourceTable => {
                progress.location = tables
                    .table_location(&request.source_table(String::new()))
                    .await?;
            }
            OnboardingStep::NewestRecord => {
                progress.newest = Some(anchor_empty(
                    tables.newest_record_time(BillingCopy::Source, account).await,
                    now,
                )?);
            }
            OnboardingStep::OldestRecord => {
                progress.oldest = Some(anchor_empty(
                    tables.oldest_record_time(BillingCopy::Source, account).await,
                    now,
                )?);
            }
            OnboardingStep::CreateMetadata => {
                let newest = progress.newest.unwrap_or(now);
                let internal = InternalTaskMetadata {
                    billing_account_id: account.to_string(),
                    customer_id: request.customer_id.clone(),
                    state: InternalTaskState::Onboarding,
                    iteration: 0,
                    ttl: None,
                    jobs: Default::default(),
                    segment: None,
                    copy_history: CopyHistory {
                        target_time: newest,
                        status: CopyHistoryStatus::Pending,
                    },
                    lifecycle_stage: LifecycleStage::Created,
                    dummy: request.dummy,
                    onboarding: true,
                    oldest_partition: progress.oldest,
                    last_update: None,
                };
                let external = ExternalTaskMetadata {
                    billing_account_id: account.to_string(),
                    customer_id: request.customer_id.clone(),
                    state: ExternalTaskState::Pending,
                    iteration: 0,
                    jobs: Default::default(),
                    segment: None,
                    bucket: BucketData::cleared(bucket_name(account)),
                    onboarding: true,
                    lifecycle_stage: LifecycleStage::Created,
                    source_table: request.source_table(progress.location.clone()),
                    last_update: None,
                };
                store.internal_tasks.create(account, internal).await?;
                if let Err(e) = store.external_tasks.create(account, external).await {
                    store.internal_tasks.delete(account).await?;
                    return Err(e);
                }
                return Ok(Some(Compensation::DeleteMetadata));
            }
            OnboardingStep::EnsureBucket => {
                self.ctx.bucket.ensure_bucket(&bucket_name(account)).await?;
            }
            OnboardingStep::CreateLocalTable => {
                tables.create_local_table(account).await?;
                return Ok(Some(Compensation::DeleteLocalTable));
            }
            OnboardingStep::MarkImportStarted => {
                if request.dummy {
                    return Ok(None);
                }
                self.ctx
                    .events
                    .set_import_status(account, ImportStatus::Started)
                    .await?;
                return Ok(Some(Compensation::ResetImportStatus));
            }
        }
        Ok(None)
    }

    async fn roll_back(&self, account: &str, compensations: Vec<Compensation>) {
        for compensation in compensations.into_iter().rev() {
            let result = match compensation {
                Compensation::DeleteMetadata => {
                    let internal = self.ctx.store.internal_tasks.delete(account).await;
                    let external = self.ctx.store.external_tasks.delete(account).await;
                    internal.and(external)
                }
                Compensation::DeleteLocalTable => self.ctx.tables.delete_local_table(account).await,
                Compensation::ResetImportStatus => {
                    self.ctx
                        .events
                        .set_import_status(account, ImportStatus::Pending)
                        .await
                }
            };
            if let Err(e) = result {
                warn!("回滚账户 {} 的 {:?} 失败: {}", account, compensation, e);
            }
        }
    }

    /// 标记账户下线, 数据由两个管理器的生命周期处理删除
    #[instrument(skip(self))]
    pub async fn offboard(&self, billing_account_id: &str) -> PipelineResult<()> {
        let store = &self.ctx.store;
        let internal = store.internal_tasks.get(billing_account_id).await?;
        let external = if self.ctx.is_master(billing_account_id) {
            None
        } else {
            Some(store.external_tasks.get(billing_account_id).await?)
        };
        if internal.onboarding || external.as_ref().is_some_and(|task| task.onboarding) {
            return Err(PipelineError::invalid_state(format!(
                "账户 {billing_account_id} 仍在接入中, 不能下线"
            )));
        }

        let deprecate = |stage: LifecycleStage| -> PipelineResult<LifecycleStage> {
            if stage.can_transition_to(LifecycleStage::Deprecated) {
                Ok(LifecycleStage::Deprecated)
            } else {
                Err(PipelineError::invalid_state(format!(
                    "账户 {billing_account_id} 不能从 {stage} 下线"
                )))
            }
        };
        store
            .internal_tasks
            .apply(billing_account_id, &|mut task: InternalTaskMetadata| {
                task.lifecycle_stage = deprecate(task.lifecycle_stage)?;
                Ok(task)
            })
            .await?;
        if external.is_some() {
            store
                .external_tasks
                .apply(billing_account_id, &|mut task: ExternalTaskMetadata| {
                    task.lifecycle_stage = deprecate(task.lifecycle_stage)?;
                    Ok(task)
                })
                .await?;
        }
        info!("账户 {} 已标记为下线", billing_account_id);
        Ok(())
    }

    /// 删除所有任务和管理器文档, 重新创建管理器和主账户的内部任务
    #[instrument(skip(self))]
    pub async fn reset_all(&self) -> PipelineResult<()> {
        let store = &self.ctx.store;
        for (account, _) in store.external_tasks.list().await? {
            store.external_tasks.delete(&account).await?;
        }
        for (account, _) in store.internal_tasks.list().await? {
            store.internal_tasks.delete(&account).await?;
        }
        for kind in [ManagerKind::Internal, ManagerKind::External] {
            store
                .managers
                .set(kind.key(), ManagerMetadata::default())
                .await?;
        }

        let master = self.ctx.config.internal_manager.master_account_id.clone();
        let now = Utc::now();
        store
            .internal_tasks
            .create(
                &master,
                InternalTaskMetadata {
                    billing_account_id: master.clone(),
                    customer_id: master.clone(),
                    state: InternalTaskState::Initializing,
                    iteration: 0,
                    ttl: None,
                    jobs: Default::default(),
                    segment: None,
                    copy_history: CopyHistory {
                        target_time: now,
                        status: CopyHistoryStatus::Pending,
                    },
                    lifecycle_stage: LifecycleStage::Active,
                    dummy: false,
                    onboarding: false,
                    oldest_partition: None,
                    last_update: None,
                },
            )
            .await?;
        warn!("已重置所有任务, 主账户 {} 重新初始化", master);
        Ok(())
    }
}
