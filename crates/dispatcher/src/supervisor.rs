//! 仓库作业监督
//!
//! 等待作业完成, 超过截止时间后取消并确认取消结果。每次轮询的判定是纯函数 [`classify`],
//! 监督循环只负责轮询, 等待和发出取消请求, 不修改任何元数据。

use std::sync::Arc;
use std::time::Duration as StdDuration;

use billing_core::models::JobStatus;
use billing_domain::{JobObservation, PipelineContext, WarehouseJobs};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::cancellation::CancellationScope;
use crate::metrics;

/// 监督所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisionPhase {
    /// 等待作业完成
    Waiting,
    /// 已发出取消请求, 等待确认
    Canceling,
}

/// 一次轮询看到的作业情况
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// 还没有作业ID
    NotStarted,
    Running,
    Done,
    Failed(String),
    CancelCallFailed,
}

impl From<JobObservation> for Observation {
    fn from(observation: JobObservation) -> Self {
        match observation {
            JobObservation::Running => Observation::Running,
            JobObservation::Done => Observation::Done,
            JobObservation::Failed(cause) => Observation::Failed(cause),
        }
    }
}

/// 作业的最终归类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobClassification {
    Done,
    Failed(String),
    ScheduleTimeout,
    Timeout,
    Stuck,
    Canceled,
    CancelButFinished,
}

impl JobClassification {
    pub fn job_status(&self) -> JobStatus {
        match self {
            JobClassification::Done | JobClassification::CancelButFinished => JobStatus::Done,
            JobClassification::Failed(_) => JobStatus::Failed,
            JobClassification::ScheduleTimeout => JobStatus::ScheduleTimeout,
            JobClassification::Timeout => JobStatus::Timeout,
            JobClassification::Stuck => JobStatus::Stuck,
            JobClassification::Canceled => JobStatus::Canceled,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobClassification::Done => "done",
            JobClassification::Failed(_) => "failed",
            JobClassification::ScheduleTimeout => "schedule_timeout",
            JobClassification::Timeout => "timeout",
            JobClassification::Stuck => "stuck",
            JobClassification::Canceled => "canceled",
            JobClassification::CancelButFinished => "cancel_but_finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVerdict {
    Continue,
    Classified(JobClassification),
}

/// 根据阶段, 观察结果和截止时间判定下一步
pub fn classify(
    phase: SupervisionPhase,
    observation: &Observation,
    deadline_passed: bool,
) -> PollVerdict {
    use JobClassification as C;
    use PollVerdict::{Classified, Continue};

    match (phase, observation) {
        (_, Observation::CancelCallFailed) => Classified(C::Stuck),

        (SupervisionPhase::Waiting, Observation::Done) => Classified(C::Done),
        (SupervisionPhase::Waiting, Observation::Failed(cause)) => {
            Classified(C::Failed(cause.clone()))
        }
        (SupervisionPhase::Waiting, Observation::Running) if deadline_passed => {
            Classified(C::Timeout)
        }
        (SupervisionPhase::Waiting, Observation::NotStarted) if deadline_passed => {
            Classified(C::ScheduleTimeout)
        }
        (SupervisionPhase::Waiting, _) => Continue,

        // 取消后作业仍然成功, 数据已经提交
        (SupervisionPhase::Canceling, Observation::Done) => Classified(C::CancelButFinished),
        (SupervisionPhase::Canceling, Observation::Failed(_)) => Classified(C::Canceled),
        (SupervisionPhase::Canceling, _) if deadline_passed => Classified(C::Stuck),
        (SupervisionPhase::Canceling, _) => Continue,
    }
}

/// 一次监督的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Failed(String),
    Stuck,
    Canceled,
    CancelButFinished,
}

impl JobOutcome {
    /// 作业写入的数据是否已提交
    pub fn is_committed(&self) -> bool {
        matches!(self, JobOutcome::Done | JobOutcome::CancelButFinished)
    }

    pub fn job_status(&self) -> JobStatus {
        match self {
            JobOutcome::Done | JobOutcome::CancelButFinished => JobStatus::Done,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Stuck => JobStatus::Stuck,
            JobOutcome::Canceled => JobStatus::Canceled,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Done => "done",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::Stuck => "stuck",
            JobOutcome::Canceled => "canceled",
            JobOutcome::CancelButFinished => "cancel_but_finished",
        }
    }
}

impl TryFrom<JobClassification> for JobOutcome {
    type Error = JobClassification;

    fn try_from(classification: JobClassification) -> Result<Self, Self::Error> {
        match classification {
            JobClassification::Done => Ok(JobOutcome::Done),
            JobClassification::Failed(cause) => Ok(JobOutcome::Failed(cause)),
            JobClassification::Stuck => Ok(JobOutcome::Stuck),
            JobClassification::Canceled => Ok(JobOutcome::Canceled),
            JobClassification::CancelButFinished => Ok(JobOutcome::CancelButFinished),
            other => Err(other),
        }
    }
}

/// 作业监督器
#[derive(Clone)]
pub struct JobSupervisor {
    warehouse: Arc<dyn WarehouseJobs>,
    poll_interval: StdDuration,
}

impl JobSupervisor {
    pub fn new(warehouse: Arc<dyn WarehouseJobs>, poll_interval: StdDuration) -> Self {
        Self {
            warehouse,
            poll_interval,
        }
    }

    pub fn from_context(ctx: &PipelineContext) -> Self {
        Self::new(ctx.warehouse.clone(), ctx.config.supervisor.poll_interval())
    }

    pub fn poll_interval(&self) -> StdDuration {
        self.poll_interval
    }

    /// 查询一次作业状态, 查询失败按仍在运行处理
    pub async fn observe(&self, job_id: &str, location: &str) -> Observation {
        match self.warehouse.status(job_id, location).await {
            Ok(observation) => observation.into(),
            Err(e) => {
                warn!("查询作业 {} 状态失败: {}", job_id, e);
                Observation::Running
            }
        }
    }

    /// 等到下一次轮询或作用域取消
    pub async fn pause(&self, scope: &CancellationScope) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = scope.cancelled() => {}
        }
    }

    /// 等待作业在 `must_finish_by` 之前完成, 超时则取消并在 `extra` 内确认
    ///
    /// `scope` 提前取消时视为到达截止时间。
    pub async fn supervise(
        &self,
        job_id: &str,
        location: &str,
        must_finish_by: DateTime<Utc>,
        extra: Duration,
        scope: &CancellationScope,
    ) -> JobOutcome {
        let waiting = scope.with_deadline(must_finish_by);
        loop {
            let observation = self.observe(job_id, location).await;
            let deadline_passed = waiting.is_cancelled() || Utc::now() > must_finish_by;
            match classify(SupervisionPhase::Waiting, &observation, deadline_passed) {
                PollVerdict::Continue => {
                    debug!("作业 {} 仍在运行", job_id);
                    self.pause(&waiting).await;
                }
                PollVerdict::Classified(classification) => {
                    match JobOutcome::try_from(classification) {
                        Ok(outcome) => return record(job_id, outcome),
                        Err(_) => break,
                    }
                }
            }
        }

        warn!("作业 {} 未在 {} 之前完成, 开始取消", job_id, must_finish_by);
        let cancel_by = must_finish_by.min(Utc::now()) + extra;
        self.cancel_and_confirm(job_id, location, cancel_by).await
    }

    /// 取消作业并轮询到 `cancel_by` 确认结果
    pub async fn cancel_and_confirm(
        &self,
        job_id: &str,
        location: &str,
        cancel_by: DateTime<Utc>,
    ) -> JobOutcome {
        if let Err(e) = self.warehouse.cancel(job_id, location).await {
            error!("取消作业 {} 失败: {}", job_id, e);
            return record(job_id, JobOutcome::Stuck);
        }

        let confirming = CancellationScope::until(cancel_by);
        loop {
            let observation = self.observe(job_id, location).await;
            let deadline_passed = confirming.is_cancelled() || Utc::now() > cancel_by;
            match classify(SupervisionPhase::Canceling, &observation, deadline_passed) {
                PollVerdict::Continue => self.pause(&confirming).await,
                PollVerdict::Classified(classification) => {
                    let outcome =
                        JobOutcome::try_from(classification).unwrap_or(JobOutcome::Stuck);
                    return record(job_id, outcome);
                }
            }
        }
    }
}

fn record(job_id: &str, outcome: JobOutcome) -> JobOutcome {
    match &outcome {
        JobOutcome::Done => info!("作业 {} 完成", job_id),
        JobOutcome::CancelButFinished => warn!("作业 {} 取消后仍然完成, 数据已提交", job_id),
        JobOutcome::Failed(cause) => error!("作业 {} 失败: {}", job_id, cause),
        JobOutcome::Canceled => warn!("作业 {} 已取消", job_id),
        JobOutcome::Stuck => error!("作业 {} 卡住, 无法确认取消", job_id),
    }
    metrics::record_job_outcome(outcome.label());
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use billing_core::{PipelineError, PipelineResult};
    use billing_domain::JobSpec;
    use mockall::mock;
    use std::sync::atomic::{AtomicU32, Ordering};

    mock! {
        pub Warehouse {}

        #[async_trait]
        impl WarehouseJobs for Warehouse {
            async fn run(&self, spec: &JobSpec) -> PipelineResult<String>;
            async fn status(&self, job_id: &str, location: &str) -> PipelineResult<JobObservation>;
            async fn cancel(&self, job_id: &str, location: &str) -> PipelineResult<()>;
            async fn find_by_prefix(&self, prefix: &str) -> PipelineResult<Option<String>>;
        }
    }

    fn supervisor(warehouse: MockWarehouse) -> JobSupervisor {
        JobSupervisor::new(Arc::new(warehouse), StdDuration::from_secs(10))
    }

    #[test]
    fn test_every_observation_maps_to_one_verdict() {
        let observations = [
            Observation::NotStarted,
            Observation::Running,
            Observation::Done,
            Observation::Failed("boom".to_string()),
            Observation::CancelCallFailed,
        ];
        for phase in [SupervisionPhase::Waiting, SupervisionPhase::Canceling] {
            for observation in &observations {
                for deadline_passed in [false, true] {
                    let verdict = classify(phase, observation, deadline_passed);
                    if deadline_passed {
                        assert_ne!(
                            verdict,
                            PollVerdict::Continue,
                            "{phase:?} {observation:?} 过期后必须有结论"
                        );
                    }
                    if verdict == PollVerdict::Classified(JobClassification::CancelButFinished) {
                        assert_eq!(phase, SupervisionPhase::Canceling);
                    }
                }
            }
        }
    }

    #[test]
    fn test_waiting_classification() {
        use JobClassification as C;
        let waiting = SupervisionPhase::Waiting;
        assert_eq!(
            classify(waiting, &Observation::Done, true),
            PollVerdict::Classified(C::Done)
        );
        assert_eq!(
            classify(waiting, &Observation::Running, false),
            PollVerdict::Continue
        );
        assert_eq!(
            classify(waiting, &Observation::Running, true),
            PollVerdict::Classified(C::Timeout)
        );
        assert_eq!(
            classify(waiting, &Observation::NotStarted, true),
            PollVerdict::Classified(C::ScheduleTimeout)
        );
        assert_eq!(
            classify(waiting, &Observation::CancelCallFailed, false),
            PollVerdict::Classified(C::Stuck)
        );
    }

    #[test]
    fn test_canceling_classification() {
        use JobClassification as C;
        let canceling = SupervisionPhase::Canceling;
        assert_eq!(
            classify(canceling, &Observation::Done, false),
            PollVerdict::Classified(C::CancelButFinished)
        );
        assert_eq!(
            classify(canceling, &Observation::Failed("x".into()), false),
            PollVerdict::Classified(C::Canceled)
        );
        assert_eq!(
            classify(canceling, &Observation::Running, true),
            PollVerdict::Classified(C::Stuck)
        );
        assert_eq!(C::CancelButFinished.job_status(), JobStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_finishing_in_time_is_done() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();
        let mut warehouse = MockWarehouse::new();
        warehouse.expect_status().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(JobObservation::Running)
            } else {
                Ok(JobObservation::Done)
            }
        });
        warehouse.expect_cancel().never();

        let outcome = supervisor(warehouse)
            .supervise(
                "job-1",
                "US",
                Utc::now() + Duration::minutes(10),
                Duration::minutes(5),
                &CancellationScope::new(),
            )
            .await;

        assert_eq!(outcome, JobOutcome::Done);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_reports_cause() {
        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_status()
            .returning(|_, _| Ok(JobObservation::Failed("quota exceeded".to_string())));

        let outcome = supervisor(warehouse)
            .supervise(
                "job-1",
                "US",
                Utc::now() + Duration::minutes(10),
                Duration::minutes(5),
                &CancellationScope::new(),
            )
            .await;
        assert_eq!(outcome, JobOutcome::Failed("quota exceeded".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_job_is_canceled() {
        let canceled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = canceled.clone();
        let mut warehouse = MockWarehouse::new();
        warehouse.expect_status().returning(move |_, _| {
            if flag.load(Ordering::SeqCst) {
                Ok(JobObservation::Failed("Job execution was cancelled".to_string()))
            } else {
                Ok(JobObservation::Running)
            }
        });
        let flag = canceled.clone();
        warehouse.expect_cancel().times(1).returning(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let outcome = supervisor(warehouse)
            .supervise(
                "job-1",
                "US",
                Utc::now() + Duration::seconds(45),
                Duration::minutes(5),
                &CancellationScope::new(),
            )
            .await;
        assert_eq!(outcome, JobOutcome::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_finishing_after_cancel_is_committed() {
        let canceled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = canceled.clone();
        let mut warehouse = MockWarehouse::new();
        warehouse.expect_status().returning(move |_, _| {
            if flag.load(Ordering::SeqCst) {
                Ok(JobObservation::Done)
            } else {
                Ok(JobObservation::Running)
            }
        });
        let flag = canceled.clone();
        warehouse.expect_cancel().returning(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let outcome = supervisor(warehouse)
            .supervise(
                "job-1",
                "US",
                Utc::now() + Duration::seconds(30),
                Duration::minutes(5),
                &CancellationScope::new(),
            )
            .await;
        assert_eq!(outcome, JobOutcome::CancelButFinished);
        assert!(outcome.is_committed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_call_failure_is_stuck() {
        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_status()
            .returning(|_, _| Ok(JobObservation::Running));
        warehouse
            .expect_cancel()
            .returning(|job_id, _| Err(PipelineError::warehouse(format!("无法取消 {job_id}"))));

        let outcome = supervisor(warehouse)
            .supervise(
                "job-1",
                "US",
                Utc::now() + Duration::seconds(30),
                Duration::minutes(5),
                &CancellationScope::new(),
            )
            .await;
        assert_eq!(outcome, JobOutcome::Stuck);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_job_is_stuck_after_cancel_budget() {
        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_status()
            .returning(|_, _| Ok(JobObservation::Running));
        warehouse.expect_cancel().returning(|_, _| Ok(()));

        let outcome = supervisor(warehouse)
            .supervise(
                "job-1",
                "US",
                Utc::now() + Duration::seconds(30),
                Duration::minutes(2),
                &CancellationScope::new(),
            )
            .await;
        assert_eq!(outcome, JobOutcome::Stuck);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_cancellation_triggers_cancel_half() {
        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_status()
            .returning(|_, _| Ok(JobObservation::Running));
        warehouse.expect_cancel().times(1).returning(|_, _| Ok(()));

        let cycle = CancellationScope::new();
        cycle.cancel();
        let outcome = supervisor(warehouse)
            .supervise(
                "job-1",
                "US",
                Utc::now() + Duration::hours(2),
                Duration::seconds(30),
                &cycle,
            )
            .await;
        assert_eq!(outcome, JobOutcome::Stuck);
    }
}
