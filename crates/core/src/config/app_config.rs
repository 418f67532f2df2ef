use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use super::sections::{
    ApiConfig, ExternalManagerConfig, InternalManagerConfig, MetadataConfig, NotificationConfig,
    QueueConfig, ReconciliationConfig, SupervisorConfig,
};
use super::ConfigValidator;

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/billing.toml",
    "billing.toml",
    "/etc/billing-pipeline/config.toml",
];

/// 流水线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub metadata: MetadataConfig,
    pub supervisor: SupervisorConfig,
    pub internal_manager: InternalManagerConfig,
    pub external_manager: ExternalManagerConfig,
    pub reconciliation: ReconciliationConfig,
    pub notifications: NotificationConfig,
    pub api: ApiConfig,
    pub queues: QueueConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序:
    /// 1. 内置默认值
    /// 2. 配置文件 (TOML), 未指定路径时依次尝试默认路径
    /// 3. 环境变量覆盖 (前缀: BILLING__)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("加载默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            info!("加载配置文件: {}", path);
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            info!("使用默认配置文件: {}", path);
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            debug!("没有找到配置文件, 使用内置默认值");
        }

        builder = builder.add_source(
            Environment::with_prefix("BILLING")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("notifications.mail_to")
                .with_list_parse_key("notifications.mail_cc")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> Result<()> {
        self.metadata.validate().context("元数据配置验证失败")?;
        self.supervisor.validate().context("作业监督配置验证失败")?;
        self.internal_manager
            .validate()
            .context("内部管理器配置验证失败")?;
        self.external_manager
            .validate()
            .context("外部管理器配置验证失败")?;
        self.reconciliation
            .validate()
            .context("对账配置验证失败")?;
        self.notifications.validate().context("通知配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.queues.validate().context("队列配置验证失败")?;
        Ok(())
    }
}
