use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::ConfigValidator;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// 乐观事务的最大尝试次数
    pub transaction_max_attempts: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            transaction_max_attempts: 20,
        }
    }
}

impl ConfigValidator for MetadataConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.transaction_max_attempts == 0 {
            return Err(anyhow::anyhow!("事务尝试次数必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_seconds: u64,
    /// 取消作业后额外等待的时间
    pub cancel_budget_seconds: i64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
            cancel_budget_seconds: 5 * 60,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn cancel_budget(&self) -> Duration {
        Duration::seconds(self.cancel_budget_seconds)
    }
}

impl ConfigValidator for SupervisorConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }
        if self.cancel_budget_seconds <= 0 {
            return Err(anyhow::anyhow!("取消等待时间必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalManagerConfig {
    pub ttl_minutes: i64,
    pub recovering_ttl_minutes: i64,
    pub recovery_step_budget: u32,
    pub wait_to_start_minutes: i64,
    pub task_max_duration_minutes: i64,
    pub master_account_id: String,
    pub segment_cap_months: u32,
}

impl Default for InternalManagerConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 60,
            recovering_ttl_minutes: 30,
            recovery_step_budget: 16,
            wait_to_start_minutes: 10,
            task_max_duration_minutes: 50,
            master_account_id: "master".to_string(),
            segment_cap_months: 3,
        }
    }
}

impl InternalManagerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::minutes(self.ttl_minutes)
    }

    /// 任务的TTL比管理器早一分钟到期
    pub fn task_ttl(&self) -> Duration {
        Duration::minutes(self.ttl_minutes - 1)
    }

    pub fn recovering_ttl(&self) -> Duration {
        Duration::minutes(self.recovering_ttl_minutes)
    }

    pub fn wait_to_start(&self) -> Duration {
        Duration::minutes(self.wait_to_start_minutes)
    }

    pub fn task_max_duration(&self) -> Duration {
        Duration::minutes(self.task_max_duration_minutes)
    }
}

impl ConfigValidator for InternalManagerConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.ttl_minutes <= 1 {
            return Err(anyhow::anyhow!("内部管理器TTL必须大于1分钟"));
        }
        if self.recovering_ttl_minutes <= 0 {
            return Err(anyhow::anyhow!("恢复TTL必须大于0"));
        }
        if self.recovery_step_budget == 0 {
            return Err(anyhow::anyhow!("恢复步数上限必须大于0"));
        }
        if self.wait_to_start_minutes <= 0 || self.task_max_duration_minutes <= 0 {
            return Err(anyhow::anyhow!("作业等待时间必须大于0"));
        }
        if self.task_max_duration_minutes >= self.ttl_minutes {
            return Err(anyhow::anyhow!(
                "任务最长执行时间({})必须小于管理器TTL({})",
                self.task_max_duration_minutes,
                self.ttl_minutes
            ));
        }
        if self.master_account_id.is_empty() {
            return Err(anyhow::anyhow!("主账户ID不能为空"));
        }
        if self.segment_cap_months == 0 {
            return Err(anyhow::anyhow!("时间段上限月数必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalManagerConfig {
    pub ttl_minutes: i64,
    pub wait_to_start_minutes: i64,
    pub job_finish_minutes: i64,
    pub onboarding_job_finish_minutes: i64,
    pub segment_cap_months: u32,
}

impl Default for ExternalManagerConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 60,
            wait_to_start_minutes: 10,
            job_finish_minutes: 120,
            onboarding_job_finish_minutes: 360,
            segment_cap_months: 3,
        }
    }
}

impl ExternalManagerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::minutes(self.ttl_minutes)
    }

    pub fn wait_to_start(&self) -> Duration {
        Duration::minutes(self.wait_to_start_minutes)
    }

    pub fn job_finish(&self, onboarding: bool) -> Duration {
        if onboarding {
            Duration::minutes(self.onboarding_job_finish_minutes)
        } else {
            Duration::minutes(self.job_finish_minutes)
        }
    }
}

impl ConfigValidator for ExternalManagerConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.ttl_minutes <= 0 {
            return Err(anyhow::anyhow!("外部管理器TTL必须大于0"));
        }
        if self.wait_to_start_minutes <= 0 {
            return Err(anyhow::anyhow!("作业等待启动时间必须大于0"));
        }
        if self.job_finish_minutes <= 0 || self.onboarding_job_finish_minutes <= 0 {
            return Err(anyhow::anyhow!("作业完成时间必须大于0"));
        }
        if self.segment_cap_months == 0 {
            return Err(anyhow::anyhow!("时间段上限月数必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub queries_per_minute: u32,
    pub default_window_months: u32,
    pub allowed_delay_hours: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            queries_per_minute: 50,
            default_window_months: 3,
            allowed_delay_hours: 9,
        }
    }
}

impl ReconciliationConfig {
    pub fn allowed_delay(&self) -> Duration {
        Duration::hours(self.allowed_delay_hours)
    }
}

impl ConfigValidator for ReconciliationConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.queries_per_minute == 0 {
            return Err(anyhow::anyhow!("每分钟查询次数必须大于0"));
        }
        if self.default_window_months == 0 {
            return Err(anyhow::anyhow!("对账窗口月数必须大于0"));
        }
        if self.allowed_delay_hours < 0 {
            return Err(anyhow::anyhow!("允许延迟不能为负数"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub mail_to: Vec<String>,
    pub mail_cc: Vec<String>,
    pub chat_channel: Option<String>,
    pub project_name: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            mail_to: vec!["billing-oncall@example.com".to_string()],
            mail_cc: Vec::new(),
            chat_channel: Some("#billing-pipeline".to_string()),
            project_name: "billing-pipeline".to_string(),
        }
    }
}

impl ConfigValidator for NotificationConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.mail_to.is_empty() && self.chat_channel.is_none() {
            return Err(anyhow::anyhow!("至少需要一个通知目标"));
        }
        if self.mail_to.iter().chain(&self.mail_cc).any(|m| !m.contains('@')) {
            return Err(anyhow::anyhow!("邮件地址格式无效"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ConfigValidator for ApiConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("API绑定地址不能为空"));
        }
        if !self.bind_address.contains(':') {
            return Err(anyhow::anyhow!(
                "API绑定地址格式无效: {}",
                self.bind_address
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub internal_tasks: String,
    pub external_tasks: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            internal_tasks: "billing-internal-tasks".to_string(),
            external_tasks: "billing-external-tasks".to_string(),
        }
    }
}

impl ConfigValidator for QueueConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.internal_tasks.is_empty() || self.external_tasks.is_empty() {
            return Err(anyhow::anyhow!("队列名称不能为空"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ttl_is_one_minute_shorter() {
        let config = InternalManagerConfig::default();
        assert_eq!(config.ttl() - config.task_ttl(), Duration::minutes(1));
    }

    #[test]
    fn test_task_duration_must_fit_in_ttl() {
        let config = InternalManagerConfig {
            task_max_duration_minutes: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_onboarding_jobs_get_longer_budget() {
        let config = ExternalManagerConfig::default();
        assert_eq!(config.job_finish(false), Duration::hours(2));
        assert_eq!(config.job_finish(true), Duration::hours(6));
    }

    #[test]
    fn test_notification_targets() {
        let config = NotificationConfig {
            mail_to: vec!["not-an-address".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
