//! 行数对账
//!
//! 独立读取账单数据的各个副本, 按时间段比较行数, 不一致的时间段逐级细分到小时,
//! 最后去重并合并相邻的时间段后告警。对账只读, 不修复任何数据。

pub mod alerts;
pub mod engine;
pub mod monitor;
pub mod segments;

use std::collections::BTreeMap;

use billing_core::models::Segment;
use billing_domain::BillingCopy;
use serde::Serialize;

pub use engine::{initial_resolution, ReconciliationEngine};
pub use monitor::{MonitorReport, ReconciliationMonitor};
pub use segments::{aggregate, deduplicate};

/// 下游副本相对上游的差异
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MismatchKind {
    Missing,
    Duplicated,
}

impl MismatchKind {
    pub fn label(&self) -> &'static str {
        match self {
            MismatchKind::Missing => "Missing",
            MismatchKind::Duplicated => "Duplicated",
        }
    }
}

/// 行数不一致的时间段, 带各个副本的行数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MismatchedSegment {
    pub segment: Segment,
    pub counts: BTreeMap<BillingCopy, u64>,
}

impl MismatchedSegment {
    pub fn new(segment: Segment, counts: impl IntoIterator<Item = (BillingCopy, u64)>) -> Self {
        Self {
            segment,
            counts: counts.into_iter().collect(),
        }
    }

    pub fn count(&self, copy: BillingCopy) -> u64 {
        self.counts.get(&copy).copied().unwrap_or(0)
    }

    /// 相邻副本之间的差异, 按数据流向排列
    pub fn differences(&self) -> Vec<(BillingCopy, BillingCopy, MismatchKind)> {
        let copies: Vec<_> = self.counts.iter().collect();
        copies
            .windows(2)
            .filter_map(|pair| {
                let (upstream, up) = pair[0];
                let (downstream, down) = pair[1];
                match down.cmp(up) {
                    std::cmp::Ordering::Less => Some((*upstream, *downstream, MismatchKind::Missing)),
                    std::cmp::Ordering::Greater => {
                        Some((*upstream, *downstream, MismatchKind::Duplicated))
                    }
                    std::cmp::Ordering::Equal => None,
                }
            })
            .collect()
    }
}

/// 一次对账的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub billing_account_id: String,
    pub window: Option<Segment>,
    pub mismatches: Vec<MismatchedSegment>,
    /// 所有副本都没有数据的时间段
    pub empty_segments: Vec<Segment>,
    /// 统计失败的查询: (副本, 时间段, 错误)
    pub failed_queries: Vec<(BillingCopy, Segment, String)>,
    pub queries: usize,
}

impl ReconciliationResult {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.failed_queries.is_empty()
    }
}
