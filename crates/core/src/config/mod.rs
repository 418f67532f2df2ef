//! 配置管理
//!
//! 配置按以下顺序合并: 内置默认值 → TOML 文件 → `BILLING__` 前缀的环境变量。
//! 环境变量使用双下划线分隔层级, 例如 `BILLING__INTERNAL_MANAGER__TTL_MINUTES=90`。

pub mod app_config;
pub mod sections;

pub use app_config::AppConfig;
pub use sections::{
    ApiConfig, ExternalManagerConfig, InternalManagerConfig, MetadataConfig, NotificationConfig,
    QueueConfig, ReconciliationConfig, SupervisorConfig,
};

/// 配置段的校验
pub trait ConfigValidator {
    fn validate(&self) -> anyhow::Result<()>;
}
