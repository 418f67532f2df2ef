//! 对账告警

use billing_core::config::NotificationConfig;
use billing_core::models::Segment;
use billing_domain::{BillingCopy, Notification, Severity};
use chrono::{DateTime, Utc};

use super::{MismatchedSegment, ReconciliationResult};
use crate::notifications::targets;

fn fmt_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

fn describe_segment(mismatch: &MismatchedSegment) -> String {
    let counts = mismatch
        .counts
        .iter()
        .map(|(copy, count)| format!("{}: {}", copy.label(), count))
        .collect::<Vec<_>>()
        .join(", ");
    let differences = mismatch
        .differences()
        .into_iter()
        .map(|(upstream, downstream, kind)| {
            format!("{} in {} (vs {})", kind.label(), downstream.label(), upstream.label())
        })
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "{} - {}: {} [{}]",
        fmt_time(mismatch.segment.start_time),
        fmt_time(mismatch.segment.end_time),
        differences,
        counts
    )
}

/// 所有不一致时间段合并为一条告警
pub fn mismatches(cfg: &NotificationConfig, result: &ReconciliationResult) -> Notification {
    let mut paragraphs = vec![format!(
        "Row counts of billing account {} disagree in {} segment(s):",
        result.billing_account_id,
        result.mismatches.len()
    )];
    paragraphs.extend(result.mismatches.iter().map(describe_segment));
    Notification {
        severity: Severity::Warning,
        paragraphs,
        targets: targets(
            cfg,
            format!(
                "IMPORTANT - {} - Billing rows mismatch for {}",
                cfg.project_name, result.billing_account_id
            ),
            "Billing row reconciliation found mismatches",
        ),
    }
}

pub fn queries_failed(cfg: &NotificationConfig, result: &ReconciliationResult) -> Notification {
    let mut paragraphs = vec![format!(
        "{} row count quer(ies) for billing account {} failed, the affected segments were not reconciled:",
        result.failed_queries.len(),
        result.billing_account_id
    )];
    paragraphs.extend(result.failed_queries.iter().map(
        |(copy, segment, cause): &(BillingCopy, Segment, String)| {
            format!("{} {}: {}", copy.label(), segment, cause)
        },
    ));
    Notification {
        severity: Severity::Warning,
        paragraphs,
        targets: targets(
            cfg,
            format!(
                "IMPORTANT - {} - Billing reconciliation incomplete for {}",
                cfg.project_name, result.billing_account_id
            ),
            "Billing row reconciliation could not finish",
        ),
    }
}

pub fn stale_data(
    cfg: &NotificationConfig,
    billing_account_id: &str,
    newest: Option<DateTime<Utc>>,
    allowed_delay_hours: i64,
) -> Notification {
    let newest = newest
        .map(fmt_time)
        .unwrap_or_else(|| "never".to_string());
    Notification {
        severity: Severity::Warning,
        paragraphs: vec![
            format!(
                "Unified billing data of billing account {billing_account_id} is older than {allowed_delay_hours} hours."
            ),
            format!("Newest exported row: {newest}"),
        ],
        targets: targets(
            cfg,
            format!(
                "IMPORTANT - {} - Billing data delayed for {}",
                cfg.project_name, billing_account_id
            ),
            "Billing data is not fresh",
        ),
    }
}

pub fn no_recent_data(
    cfg: &NotificationConfig,
    billing_account_id: &str,
    week: &Segment,
) -> Notification {
    Notification {
        severity: Severity::Warning,
        paragraphs: vec![format!(
            "Unified billing table has no rows for billing account {billing_account_id} in {week}."
        )],
        targets: targets(
            cfg,
            format!(
                "IMPORTANT - {} - No billing data in the past week for {}",
                cfg.project_name, billing_account_id
            ),
            "Billing data missing for the past week",
        ),
    }
}
