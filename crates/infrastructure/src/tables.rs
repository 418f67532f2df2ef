use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use billing_core::models::{BillingTableInfo, Segment};
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{tmp_table_name, BillingCopy, BillingTables, Resolution};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_LOCATION: &str = "US";

#[derive(Debug, Default)]
struct TablesState {
    rows: HashMap<(BillingCopy, String), Vec<DateTime<Utc>>>,
    local_tables: HashSet<String>,
    tmp_tables: HashMap<String, Vec<(String, DateTime<Utc>)>>,
    staged: HashMap<(String, String, i64), Vec<DateTime<Utc>>>,
    locations: HashMap<String, String>,
    failing_counts: HashSet<BillingCopy>,
    tmp_table_fails: bool,
}

/// 内存账单表
///
/// 每行只保存导出时间。仓库作业完成时通过 `export_to_stage` 等方法搬运数据行。
#[derive(Debug, Default)]
pub struct InMemoryBillingTables {
    state: RwLock<TablesState>,
}

impl InMemoryBillingTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_rows(
        &self,
        copy: BillingCopy,
        billing_account_id: &str,
        rows: impl IntoIterator<Item = DateTime<Utc>>,
    ) {
        let mut state = self.state.write().await;
        state
            .rows
            .entry((copy, billing_account_id.to_string()))
            .or_default()
            .extend(rows);
    }

    pub async fn rows(&self, copy: BillingCopy, billing_account_id: &str) -> Vec<DateTime<Utc>> {
        let state = self.state.read().await;
        let mut rows = state
            .rows
            .get(&(copy, billing_account_id.to_string()))
            .cloned()
            .unwrap_or_default();
        rows.sort();
        rows
    }

    pub async fn set_location(&self, table: &BillingTableInfo, location: &str) {
        self.state
            .write()
            .await
            .locations
            .insert(table.full_name(), location.to_string());
    }

    pub async fn fail_counts_for(&self, copy: BillingCopy) {
        self.state.write().await.failing_counts.insert(copy);
    }

    pub async fn set_tmp_table_fails(&self, fails: bool) {
        self.state.write().await.tmp_table_fails = fails;
    }

    pub async fn has_local_table(&self, billing_account_id: &str) -> bool {
        self.state
            .read()
            .await
            .local_tables
            .contains(billing_account_id)
    }

    pub async fn has_tmp_table(&self, iteration: i64) -> bool {
        self.state
            .read()
            .await
            .tmp_tables
            .contains_key(&tmp_table_name(iteration))
    }

    pub async fn tmp_rows(&self, tmp_table: &str) -> Vec<(String, DateTime<Utc>)> {
        self.state
            .read()
            .await
            .tmp_tables
            .get(tmp_table)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn export_to_stage(
        &self,
        billing_account_id: &str,
        segment: &Segment,
        bucket: &str,
        timestamp: i64,
    ) -> usize {
        let mut state = self.state.write().await;
        let rows: Vec<_> = state
            .rows
            .get(&(BillingCopy::Source, billing_account_id.to_string()))
            .map(|rows| rows.iter().copied().filter(|t| segment.contains(*t)).collect())
            .unwrap_or_default();
        let count = rows.len();
        state.staged.insert(
            (bucket.to_string(), billing_account_id.to_string(), timestamp),
            rows,
        );
        count
    }

    pub(crate) async fn load_from_stage(
        &self,
        billing_account_id: &str,
        bucket: &str,
        timestamp: i64,
    ) -> PipelineResult<usize> {
        let mut state = self.state.write().await;
        let rows = state
            .staged
            .get(&(bucket.to_string(), billing_account_id.to_string(), timestamp))
            .cloned()
            .ok_or_else(|| {
                PipelineError::Storage(format!(
                    "暂存文件不存在: {bucket}/{billing_account_id}/{timestamp}"
                ))
            })?;
        let count = rows.len();
        state
            .rows
            .entry((BillingCopy::Local, billing_account_id.to_string()))
            .or_default()
            .extend(rows);
        Ok(count)
    }

    pub(crate) async fn copy_to_tmp(
        &self,
        copy: BillingCopy,
        billing_account_id: &str,
        segment: &Segment,
        tmp_table: &str,
    ) -> PipelineResult<usize> {
        let mut state = self.state.write().await;
        let rows: Vec<_> = state
            .rows
            .get(&(copy, billing_account_id.to_string()))
            .map(|rows| rows.iter().copied().filter(|t| segment.contains(*t)).collect())
            .unwrap_or_default();
        let tmp = state
            .tmp_tables
            .get_mut(tmp_table)
            .ok_or_else(|| PipelineError::Warehouse(format!("临时表不存在: {tmp_table}")))?;
        let count = rows.len();
        tmp.extend(rows.into_iter().map(|t| (billing_account_id.to_string(), t)));
        Ok(count)
    }

    pub(crate) async fn merge_tmp_into_unified(
        &self,
        tmp_table: &str,
        billing_account_ids: &[String],
    ) -> PipelineResult<usize> {
        let mut state = self.state.write().await;
        let rows: Vec<_> = state
            .tmp_tables
            .get(tmp_table)
            .ok_or_else(|| PipelineError::Warehouse(format!("临时表不存在: {tmp_table}")))?
            .iter()
            .filter(|(account, _)| billing_account_ids.contains(account))
            .cloned()
            .collect();
        let count = rows.len();
        for (account, t) in rows {
            state
                .rows
                .entry((BillingCopy::Unified, account))
                .or_default()
                .push(t);
        }
        Ok(count)
    }

    pub(crate) async fn delete_from_unified(&self, billing_account_id: &str) -> usize {
        self.state
            .write()
            .await
            .rows
            .remove(&(BillingCopy::Unified, billing_account_id.to_string()))
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    fn table_name(copy: BillingCopy, billing_account_id: &str) -> String {
        format!("{}:{}", copy.label(), billing_account_id)
    }
}

#[async_trait]
impl BillingTables for InMemoryBillingTables {
    async fn newest_record_time(
        &self,
        copy: BillingCopy,
        billing_account_id: &str,
    ) -> PipelineResult<DateTime<Utc>> {
        let state = self.state.read().await;
        state
            .rows
            .get(&(copy, billing_account_id.to_string()))
            .and_then(|rows| rows.iter().max().copied())
            .ok_or_else(|| PipelineError::EmptyBillingTable {
                table: Self::table_name(copy, billing_account_id),
            })
    }

    async fn oldest_record_time(
        &self,
        copy: BillingCopy,
        billing_account_id: &str,
    ) -> PipelineResult<DateTime<Utc>> {
        let state = self.state.read().await;
        state
            .rows
            .get(&(copy, billing_account_id.to_string()))
            .and_then(|rows| rows.iter().min().copied())
            .ok_or_else(|| PipelineError::EmptyBillingTable {
                table: Self::table_name(copy, billing_account_id),
            })
    }

    async fn oldest_record_time_after(
        &self,
        copy: BillingCopy,
        billing_account_id: &str,
        after: DateTime<Utc>,
    ) -> PipelineResult<DateTime<Utc>> {
        let state = self.state.read().await;
        state
            .rows
            .get(&(copy, billing_account_id.to_string()))
            .and_then(|rows| rows.iter().filter(|t| **t > after).min().copied())
            .ok_or_else(|| PipelineError::EmptyBillingTable {
                table: Self::table_name(copy, billing_account_id),
            })
    }

    async fn table_location(&self, table: &BillingTableInfo) -> PipelineResult<String> {
        let state = self.state.read().await;
        Ok(state
            .locations
            .get(&table.full_name())
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string()))
    }

    async fn create_local_table(&self, billing_account_id: &str) -> PipelineResult<()> {
        self.state
            .write()
            .await
            .local_tables
            .insert(billing_account_id.to_string());
        Ok(())
    }

    async fn delete_local_table(&self, billing_account_id: &str) -> PipelineResult<()> {
        let mut state = self.state.write().await;
        state.local_tables.remove(billing_account_id);
        state
            .rows
            .remove(&(BillingCopy::Local, billing_account_id.to_string()));
        Ok(())
    }

    async fn create_tmp_table(&self, iteration: i64) -> PipelineResult<String> {
        let name = tmp_table_name(iteration);
        let mut state = self.state.write().await;
        if state.tmp_table_fails {
            return Err(PipelineError::warehouse(format!("创建临时表失败: {name}")));
        }
        state.tmp_tables.entry(name.clone()).or_default();
        debug!("创建临时表 {}", name);
        Ok(name)
    }

    async fn drop_tmp_table(&self, iteration: i64) -> PipelineResult<()> {
        self.state
            .write()
            .await
            .tmp_tables
            .remove(&tmp_table_name(iteration));
        Ok(())
    }

    async fn count_rows(
        &self,
        copy: BillingCopy,
        billing_account_id: &str,
        window: &Segment,
        resolution: Resolution,
    ) -> PipelineResult<BTreeMap<Segment, u64>> {
        let state = self.state.read().await;
        if state.failing_counts.contains(&copy) {
            return Err(PipelineError::warehouse(format!(
                "统计 {} 行数失败",
                Self::table_name(copy, billing_account_id)
            )));
        }

        let mut counts = BTreeMap::new();
        let rows = state.rows.get(&(copy, billing_account_id.to_string()));
        for t in rows.into_iter().flatten().filter(|t| window.covers(**t)) {
            let bucket = resolution.bucket_of(*t);
            let clamped = Segment::new(
                bucket.start_time.max(window.start_time),
                bucket.end_time.min(window.end_time),
            );
            *counts.entry(clamped).or_insert(0u64) += 1;
        }
        Ok(counts)
    }
}
