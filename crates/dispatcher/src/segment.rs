//! 时间段计算
//!
//! 每个账户的拷贝窗口首尾相接: 新窗口的起点是上一个窗口的终点,
//! 第一次从最早一行之前一秒开始, 终点不超过最新一行, 长度不超过 `cap_months` 个月。

use billing_core::models::Segment;
use billing_core::PipelineResult;
use billing_domain::{BillingCopy, BillingTables};
use chrono::{DateTime, Duration, Months, Utc};
use tracing::debug;

/// 计算下一个拷贝窗口
///
/// 没有新数据时返回起止相同的空窗口。
pub fn next_segment(
    prev: Option<&Segment>,
    oldest: DateTime<Utc>,
    newest: DateTime<Utc>,
    cap_months: u32,
) -> Segment {
    let start = match prev {
        Some(prev) => prev.end_time,
        None => oldest - Duration::seconds(1),
    };
    let capped = start
        .checked_add_months(Months::new(cap_months))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let end = capped.min(newest).max(start);
    Segment::new(start, end)
}

/// 读取表边界并计算下一个时间段, 表为空时返回 `None`
pub async fn load_next_segment(
    tables: &dyn BillingTables,
    copy: BillingCopy,
    billing_account_id: &str,
    prev: Option<&Segment>,
    cap_months: u32,
) -> PipelineResult<Option<Segment>> {
    let newest = match tables.newest_record_time(copy, billing_account_id).await {
        Ok(newest) => newest,
        Err(e) if e.is_empty_table() => {
            debug!("{} 的 {} 为空, 本轮跳过", billing_account_id, copy.label());
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    let oldest = match prev {
        Some(_) => newest,
        None => tables.oldest_record_time(copy, billing_account_id).await?,
    };
    Ok(Some(next_segment(prev, oldest, newest, cap_months)))
}

/// 空表不是错误, 用 `now` 代替 (接入账户时使用)
pub fn anchor_empty(
    result: PipelineResult<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> PipelineResult<DateTime<Utc>> {
    match result {
        Err(e) if e.is_empty_table() => Ok(now),
        other => other,
    }
}
