use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU32;
use std::sync::Arc;

use billing_core::models::Segment;
use billing_core::PipelineResult;
use billing_domain::{BillingCopy, BillingTables, Resolution};
use chrono::Duration;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::{debug, warn};

use super::segments::{aggregate, deduplicate};
use super::{MismatchedSegment, ReconciliationResult};

/// 按窗口长度选择起始粒度
pub fn initial_resolution(window: &Segment) -> Resolution {
    let length = window.duration();
    if length <= Duration::days(1) {
        Resolution::Hour
    } else if length <= Duration::days(60) {
        Resolution::Day
    } else {
        Resolution::Month
    }
}

/// 对账引擎, 所有统计查询共享一个限流器
#[derive(Clone)]
pub struct ReconciliationEngine {
    tables: Arc<dyn BillingTables>,
    limiter: Arc<DefaultDirectRateLimiter>,
    master_account_id: String,
}

impl ReconciliationEngine {
    pub fn new(
        tables: Arc<dyn BillingTables>,
        queries_per_minute: u32,
        master_account_id: impl Into<String>,
    ) -> Self {
        let rate = NonZeroU32::new(queries_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            tables,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(rate))),
            master_account_id: master_account_id.into(),
        }
    }

    /// 需要比较的副本, 主账户没有客户源表
    pub fn copies_for(&self, billing_account_id: &str) -> Vec<BillingCopy> {
        if billing_account_id == self.master_account_id {
            vec![BillingCopy::Raw, BillingCopy::Unified]
        } else {
            vec![BillingCopy::Source, BillingCopy::Local, BillingCopy::Unified]
        }
    }

    /// 经过限流的单次行数统计
    pub async fn count_rows(
        &self,
        copy: BillingCopy,
        billing_account_id: &str,
        window: &Segment,
        resolution: Resolution,
    ) -> PipelineResult<BTreeMap<Segment, u64>> {
        self.limiter.until_ready().await;
        self.tables
            .count_rows(copy, billing_account_id, window, resolution)
            .await
    }

    /// 对账一个窗口, 返回合并后的最小不一致时间段
    pub async fn reconcile(
        &self,
        billing_account_id: &str,
        window: Segment,
    ) -> PipelineResult<ReconciliationResult> {
        let copies = self.copies_for(billing_account_id);
        let mut result = ReconciliationResult {
            billing_account_id: billing_account_id.to_string(),
            window: Some(window),
            ..Default::default()
        };
        let mut found = Vec::new();
        let mut pending = vec![(window, initial_resolution(&window))];

        while let Some((segment, resolution)) = pending.pop() {
            let mut per_copy = BTreeMap::new();
            for copy in &copies {
                result.queries += 1;
                match self
                    .count_rows(*copy, billing_account_id, &segment, resolution)
                    .await
                {
                    Ok(counts) => {
                        per_copy.insert(*copy, counts);
                    }
                    Err(e) => {
                        warn!(
                            "统计 {} 的 {} 在 {} 的行数失败: {}",
                            billing_account_id,
                            copy.label(),
                            segment,
                            e
                        );
                        result.failed_queries.push((*copy, segment, e.to_string()));
                    }
                }
            }
            if per_copy.len() != copies.len() {
                continue;
            }

            let buckets: BTreeSet<Segment> =
                per_copy.values().flat_map(|counts| counts.keys().copied()).collect();
            if buckets.is_empty() {
                result.empty_segments.push(segment);
                continue;
            }

            for bucket in buckets {
                let counts: Vec<(BillingCopy, u64)> = per_copy
                    .iter()
                    .map(|(copy, counts)| (*copy, counts.get(&bucket).copied().unwrap_or(0)))
                    .collect();
                if counts.windows(2).all(|pair| pair[0].1 == pair[1].1) {
                    continue;
                }
                match resolution.finer() {
                    Some(finer) => pending.push((bucket, finer)),
                    None => found.push(MismatchedSegment::new(bucket, counts)),
                }
            }
        }

        result.mismatches = aggregate(deduplicate(found));
        result.empty_segments.sort();
        debug!(
            "{} 对账完成: {} 次查询, {} 个不一致时间段",
            billing_account_id,
            result.queries,
            result.mismatches.len()
        );
        Ok(result)
    }
}
