//! Billing Dispatcher
//!
//! 管理器编排层: 每个周期抢占管理器租约, 按账户推进内部与外部任务状态机,
//! 监督仓库作业, 失败时沿恢复阶梯自愈。另外提供账户接入/下线和行数对账。

pub mod cancellation;
pub mod downstream;
pub mod external_manager;
pub mod external_task;
pub mod fanout;
pub mod internal_manager;
pub mod internal_task;
pub mod lease;
pub mod metrics;
pub mod notifications;
pub mod onboarding;
pub mod reconciliation;
pub mod recovery_service;
pub mod segment;
pub mod supervisor;

pub use cancellation::CancellationScope;
pub use external_manager::{ExternalCycleReport, ExternalManager};
pub use fanout::{fan_out, FanOutReport};
pub use internal_manager::{InternalCycleReport, InternalManager};
pub use onboarding::{Onboarding, OnboardingReport, OnboardingRequest, OnboardingStep};
pub use reconciliation::{
    MonitorReport, ReconciliationEngine, ReconciliationMonitor, ReconciliationResult,
};
pub use recovery_service::{
    ManagerRecoveryService, RecoveryConfig, RecoveryReport, RecoveryService,
};
pub use supervisor::{JobOutcome, JobSupervisor};
