//! 周期与作业结果计数
//!
//! 只通过 `metrics` 门面记录, 导出器由部署方自行安装。

pub const MANAGER_CYCLES_TOTAL: &str = "billing_manager_cycles_total";
pub const JOB_OUTCOMES_TOTAL: &str = "billing_job_outcomes_total";
pub const RECONCILIATION_MISMATCHES_TOTAL: &str = "billing_reconciliation_mismatches_total";

pub fn record_cycle(manager: &'static str, outcome: &'static str) {
    metrics::counter!(MANAGER_CYCLES_TOTAL, "manager" => manager, "outcome" => outcome).increment(1);
}

pub fn record_job_outcome(outcome: &'static str) {
    metrics::counter!(JOB_OUTCOMES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_mismatches(count: usize) {
    metrics::counter!(RECONCILIATION_MISMATCHES_TOTAL).increment(count as u64);
}
