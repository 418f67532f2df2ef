//! Test helper utilities and common testing patterns

use std::time::Duration;

use billing_core::AppConfig;
use chrono::{DateTime, Utc};
use tokio::time::sleep;

/// 解析 RFC 3339 时间, 仅用于测试
pub fn at(s: &str) -> DateTime<Utc> {
    s.parse()
        .unwrap_or_else(|e| panic!("无效的测试时间 {s}: {e}"))
}

/// 测试用配置: 轮询间隔缩短到一秒, 对账不限流
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.supervisor.poll_interval_seconds = 1;
    config.supervisor.cancel_budget_seconds = 60;
    config.reconciliation.queries_per_minute = 60_000;
    config.metadata.transaction_max_attempts = 5;
    config
}

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        Self::wait_for_with_interval(&mut condition, timeout, Duration::from_millis(100)).await
    }

    /// Wait for a condition with a custom poll interval
    pub async fn wait_for_with_interval<F, Fut>(
        mut condition: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition().await {
                return true;
            }
            sleep(poll_interval).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billing_core::ConfigValidator;

    #[test]
    fn test_config_is_valid() {
        assert!(test_config().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        let mut calls = 0;
        let ok = TestEnv::wait_for(
            || {
                calls += 1;
                async { false }
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(!ok);
        assert!(calls >= 10);
    }
}
