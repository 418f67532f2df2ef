//! 运维告警的构造

use billing_core::config::NotificationConfig;
use billing_core::PipelineError;
use billing_domain::{
    MailTarget, ManagerKind, Notification, NotificationSink, NotificationTargets, Severity,
};
use tracing::error;

/// 发送告警, 失败只记录日志
pub async fn send_alert(sink: &dyn NotificationSink, notification: Notification) {
    if let Err(e) = sink.send(&notification).await {
        error!(
            "发送告警失败 ({}): {}",
            notification.subject().unwrap_or("-"),
            e
        );
    }
}

/// 按配置生成邮件与聊天目标
pub fn targets(cfg: &NotificationConfig, subject: String, preheader: &str) -> NotificationTargets {
    let mail = (!cfg.mail_to.is_empty()).then(|| MailTarget {
        to: cfg.mail_to.clone(),
        cc: cfg.mail_cc.clone(),
        subject,
        preheader: preheader.to_string(),
    });
    NotificationTargets {
        mail,
        chat: cfg.chat_channel.clone(),
    }
}

pub fn cycle_failed(
    cfg: &NotificationConfig,
    kind: ManagerKind,
    iteration: i64,
    err: &PipelineError,
) -> Notification {
    Notification {
        severity: Severity::Error,
        paragraphs: vec![
            format!("{} manager iteration {} failed.", kind, iteration),
            format!("Cause: {err}"),
            "The next cycle will run recovery before starting a new iteration.".to_string(),
        ],
        targets: targets(
            cfg,
            format!("URGENT - {} - Billing {} manager failed", cfg.project_name, kind),
            "Billing pipeline cycle failed",
        ),
    }
}

pub fn account_errors(
    cfg: &NotificationConfig,
    kind: ManagerKind,
    iteration: i64,
    failures: &[(String, PipelineError)],
) -> Notification {
    let mut paragraphs = vec![format!(
        "{} manager iteration {} could not advance {} account(s):",
        kind,
        iteration,
        failures.len()
    )];
    paragraphs.extend(
        failures
            .iter()
            .map(|(account, err)| format!("{account}: {err}")),
    );
    Notification {
        severity: Severity::Warning,
        paragraphs,
        targets: targets(
            cfg,
            format!("IMPORTANT - {} - Billing accounts not advanced", cfg.project_name),
            "Some billing accounts were not advanced",
        ),
    }
}

pub fn onboarding_failed(
    cfg: &NotificationConfig,
    billing_account_id: &str,
    step: &str,
    err: &PipelineError,
) -> Notification {
    Notification {
        severity: Severity::Error,
        paragraphs: vec![
            format!("Onboarding of billing account {billing_account_id} failed at step \"{step}\"."),
            format!("Cause: {err}"),
            "Completed steps were rolled back.".to_string(),
        ],
        targets: targets(
            cfg,
            format!("IMPORTANT - {} - Onboarding failed for {}", cfg.project_name, billing_account_id),
            "Billing account onboarding failed",
        ),
    }
}
