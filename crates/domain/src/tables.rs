use std::collections::BTreeMap;

use async_trait::async_trait;
use billing_core::models::{BillingTableInfo, Segment};
use billing_core::PipelineResult;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// 账单数据的各个副本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCopy {
    /// 客户仓库中的源表
    Source,
    /// 每个账户的本地表
    Local,
    /// 主账户的原始表
    Raw,
    /// 统一表
    Unified,
}

impl BillingCopy {
    pub fn label(&self) -> &'static str {
        match self {
            BillingCopy::Source => "Customer Billing",
            BillingCopy::Local => "Local Billing",
            BillingCopy::Raw => "Raw Billing",
            BillingCopy::Unified => "Unified Billing",
        }
    }
}

/// 行数统计的时间粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Hour,
    Day,
    Month,
}

impl Resolution {
    /// 更细一级的粒度
    pub fn finer(&self) -> Option<Resolution> {
        match self {
            Resolution::Month => Some(Resolution::Day),
            Resolution::Day => Some(Resolution::Hour),
            Resolution::Hour => None,
        }
    }

    /// 把时间截断到所属的桶起点
    pub fn truncate(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let hour = at
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(at);
        match self {
            Resolution::Hour => hour,
            Resolution::Day => hour.with_hour(0).unwrap_or(hour),
            Resolution::Month => Utc
                .with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(hour),
        }
    }

    /// 桶的结束时间
    pub fn bucket_end(&self, bucket_start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Resolution::Hour => bucket_start + Duration::hours(1),
            Resolution::Day => bucket_start + Duration::days(1),
            Resolution::Month => bucket_start
                .checked_add_months(chrono::Months::new(1))
                .unwrap_or(bucket_start + Duration::days(31)),
        }
    }

    pub fn bucket_of(&self, at: DateTime<Utc>) -> Segment {
        let start = self.truncate(at);
        Segment::new(start, self.bucket_end(start))
    }
}

/// 账单表操作
#[async_trait]
pub trait BillingTables: Send + Sync {
    /// 表为空时返回 `EmptyBillingTable`
    async fn newest_record_time(
        &self,
        copy: BillingCopy,
        billing_account_id: &str,
    ) -> PipelineResult<DateTime<Utc>>;

    async fn oldest_record_time(
        &self,
        copy: BillingCopy,
        billing_account_id: &str,
    ) -> PipelineResult<DateTime<Utc>>;

    /// 晚于 `after` 的最早一行, 没有时返回 `EmptyBillingTable`
    async fn oldest_record_time_after(
        &self,
        copy: BillingCopy,
        billing_account_id: &str,
        after: DateTime<Utc>,
    ) -> PipelineResult<DateTime<Utc>>;
    async fn table_location(&self, table: &BillingTableInfo) -> PipelineResult<String>;

    async fn create_local_table(&self, billing_account_id: &str) -> PipelineResult<()>;

    async fn delete_local_table(&self, billing_account_id: &str) -> PipelineResult<()>;

    /// 创建本轮迭代的临时表, 返回表名
    async fn create_tmp_table(&self, iteration: i64) -> PipelineResult<String>;

    async fn drop_tmp_table(&self, iteration: i64) -> PipelineResult<()>;

    /// 按粒度分组统计窗口内的行数, 没有数据的桶不出现在结果中
    async fn count_rows(
        &self,
        copy: BillingCopy,
        billing_account_id: &str,
        window: &Segment,
        resolution: Resolution,
    ) -> PipelineResult<BTreeMap<Segment, u64>>;
}

pub fn tmp_table_name(iteration: i64) -> String {
    format!("billing_tmp_{iteration}")
}
