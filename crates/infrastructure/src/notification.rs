use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{Notification, NotificationSink, Severity};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// 把通知写入日志并保留副本
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    sent: RwLock<Vec<Notification>>,
    fails: AtomicBool,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fails(&self, fails: bool) {
        self.fails.store(fails, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }

    pub async fn clear(&self) {
        self.sent.write().await.clear();
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn send(&self, notification: &Notification) -> PipelineResult<()> {
        if self.fails.load(Ordering::SeqCst) {
            return Err(PipelineError::Notification("通知通道不可用".to_string()));
        }
        let subject = notification.subject().unwrap_or("-");
        let body = notification.paragraphs.join("\n");
        match notification.severity {
            Severity::Info => info!(subject, "{}", body),
            Severity::Warning => warn!(subject, "{}", body),
            Severity::Error => error!(subject, "{}", body),
        }
        self.sent.write().await.push(notification.clone());
        Ok(())
    }
}
