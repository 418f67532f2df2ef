use async_trait::async_trait;
use billing_core::PipelineResult;

/// 暂存桶
///
/// 文件按 `bucket/account/timestamp/*` 写入, 只写一次, 按账户和时间戳前缀删除。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn ensure_bucket(&self, bucket: &str) -> PipelineResult<()>;

    /// 返回删除的文件数
    async fn delete_prefix(
        &self,
        bucket: &str,
        billing_account_id: &str,
        timestamp: i64,
    ) -> PipelineResult<usize>;

    async fn exists(
        &self,
        bucket: &str,
        billing_account_id: &str,
        timestamp: i64,
    ) -> PipelineResult<bool>;
}

pub fn staging_prefix(billing_account_id: &str, timestamp: i64) -> String {
    format!("{billing_account_id}/{timestamp}/")
}

pub fn staging_uri(bucket: &str, billing_account_id: &str, timestamp: i64) -> String {
    format!(
        "gs://{bucket}/{}*",
        staging_prefix(billing_account_id, timestamp)
    )
}

pub fn bucket_name(billing_account_id: &str) -> String {
    format!("billing-staging-{}", billing_account_id.to_lowercase())
}
