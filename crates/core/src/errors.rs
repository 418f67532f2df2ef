use thiserror::Error;

/// 流水线错误类型定义
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("迭代号不匹配: 期望 {expected}, 实际 {found}")]
    StaleIteration { expected: i64, found: i64 },

    #[error("作业执行失败: {job_id} - {cause}")]
    JobExecutionFailure { job_id: String, cause: String },

    #[error("作业超时: {job_id}")]
    JobTimeout { job_id: String },

    #[error("作业卡住, 无法取消: {job_id}")]
    JobStuck { job_id: String },

    #[error("作业已取消: {job_id}")]
    JobCanceled { job_id: String },

    #[error("作业取消后仍然完成: {job_id}")]
    JobCancelButFinished { job_id: String },

    #[error("账单表为空: {table}")]
    EmptyBillingTable { table: String },

    #[error("无效的元数据状态: {0}")]
    InvalidMetadataState(String),

    #[error("文档未找到: {key}")]
    NotFound { key: String },

    #[error("文档已存在: {key}")]
    AlreadyExists { key: String },

    #[error("事务冲突, 已重试 {attempts} 次: {key}")]
    TransactionConflict { key: String, attempts: u32 },

    #[error("上一轮迭代 {iteration} 仍持有租约, 剩余 {remaining_seconds} 秒")]
    LeaseHeld {
        iteration: i64,
        remaining_seconds: i64,
    },

    #[error("另一个恢复流程正在进行中")]
    RecoveryInProgress,

    #[error("迭代 {iteration} 的恢复停在 {state}, 本轮不开始新周期")]
    RecoveryIncomplete { iteration: i64, state: String },

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("数据仓库错误: {0}")]
    Warehouse(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("任务队列错误: {0}")]
    TaskQueue(String),

    #[error("通知发送失败: {0}")]
    Notification(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn stale_iteration(expected: i64, found: i64) -> Self {
        Self::StaleIteration { expected, found }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidMetadataState(msg.into())
    }

    pub fn warehouse(msg: impl Into<String>) -> Self {
        Self::Warehouse(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_stale_iteration(&self) -> bool {
        matches!(self, Self::StaleIteration { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_empty_table(&self) -> bool {
        matches!(self, Self::EmptyBillingTable { .. })
    }

    /// 只影响单个账户本轮处理的错误, 不会中止整个管理器
    pub fn is_account_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidMetadataState(_)
                | Self::StaleIteration { .. }
                | Self::JobExecutionFailure { .. }
                | Self::JobCanceled { .. }
                | Self::JobStuck { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransactionConflict { .. }
                | Self::Warehouse(_)
                | Self::Storage(_)
                | Self::TaskQueue(_)
                | Self::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// 统一的Result类型
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(PipelineError::stale_iteration(1, 2).is_stale_iteration());
        assert!(PipelineError::stale_iteration(1, 2).is_account_fatal());
        assert!(PipelineError::invalid_state("缺少作业").is_account_fatal());
        assert!(!PipelineError::EmptyBillingTable {
            table: "t".to_string()
        }
        .is_account_fatal());
        assert!(PipelineError::TransactionConflict {
            key: "k".to_string(),
            attempts: 20
        }
        .is_retryable());
        assert!(!PipelineError::RecoveryInProgress.is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::stale_iteration(3, 4);
        assert_eq!(err.to_string(), "迭代号不匹配: 期望 3, 实际 4");
    }
}
