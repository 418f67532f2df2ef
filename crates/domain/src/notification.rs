use async_trait::async_trait;
use billing_core::PipelineResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MailTarget {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub preheader: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NotificationTargets {
    pub mail: Option<MailTarget>,
    pub chat: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub severity: Severity,
    pub paragraphs: Vec<String>,
    pub targets: NotificationTargets,
}

impl Notification {
    pub fn subject(&self) -> Option<&str> {
        self.targets.mail.as_ref().map(|m| m.subject.as_str())
    }
}

/// 告警出口
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> PipelineResult<()>;
}
