use serde::{Deserialize, Serialize};
use std::fmt;

/// 外部任务状态 (仓库 → 暂存桶 → 本地表)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExternalTaskState {
    #[default]
    Pending,
    WaitingForToBucket,
    ToTaskScheduled,
    ToBucket,
    WaitingForFromBucket,
    FromTaskScheduled,
    FromBucket,
    DoneOnboarding,
    Failed,
}

/// 内部任务状态 (本地表 → 临时表 → 统一表)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InternalTaskState {
    #[default]
    Initializing,
    Pending,
    Running,
    Verified,
    Notified,
    Done,
    Failed,
    Skipped,
    Onboarding,
}

/// 管理器状态, 按执行顺序排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Started,
    TmpTableCreated,
    TasksUpdated,
    TasksCreated,
    TasksDone,
    Marked,
    CopiedToUnified,
    Notified,
    #[default]
    Done,
    Failed,
}

/// 状态执行顺序表
const MANAGER_STATE_ORDER: [(ManagerState, u8); 10] = [
    (ManagerState::Started, 1),
    (ManagerState::TmpTableCreated, 2),
    (ManagerState::TasksUpdated, 3),
    (ManagerState::TasksCreated, 4),
    (ManagerState::TasksDone, 5),
    (ManagerState::Marked, 6),
    (ManagerState::CopiedToUnified, 7),
    (ManagerState::Notified, 8),
    (ManagerState::Done, 9),
    (ManagerState::Failed, 10),
];

impl ManagerState {
    pub fn rank(&self) -> u8 {
        MANAGER_STATE_ORDER
            .iter()
            .find(|(state, _)| state == self)
            .map(|(_, rank)| *rank)
            .unwrap_or(u8::MAX)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn all() -> impl Iterator<Item = ManagerState> {
        MANAGER_STATE_ORDER.iter().map(|(state, _)| *state)
    }
}

impl PartialOrd for ManagerState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ManagerState {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// 账户生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    #[default]
    Created,
    Active,
    Paused,
    Deprecated,
}

impl LifecycleStage {
    /// Created→Active→(Paused⇄Active)→Deprecated, 从Deprecated不可逆
    pub fn can_transition_to(&self, next: LifecycleStage) -> bool {
        use LifecycleStage::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Created, Active) | (Created, Deprecated) => true,
            (Active, Paused) | (Active, Deprecated) => true,
            (Paused, Active) | (Paused, Deprecated) => true,
            _ => false,
        }
    }
}

/// 历史数据拷贝进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CopyHistoryStatus {
    #[default]
    Pending,
    Copying,
    Notified,
    Done,
    Failed,
}

macro_rules! impl_display_via_serde {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    let name = serde_json::to_value(self)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_owned))
                        .unwrap_or_else(|| format!("{:?}", self));
                    f.write_str(&name)
                }
            }
        )*
    };
}

impl_display_via_serde!(
    ExternalTaskState,
    InternalTaskState,
    ManagerState,
    LifecycleStage,
    CopyHistoryStatus
);
