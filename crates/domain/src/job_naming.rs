//! 仓库作业ID前缀
//!
//! 前缀由账户和迭代号确定, 元数据丢失作业ID后可以按前缀在近期作业中找回。

/// 本地表, 临时表和统一表所在的区域
pub const PIPELINE_LOCATION: &str = "US";

/// 外部任务的两个阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalStage {
    ToBucket,
    FromBucket,
}

impl ExternalStage {
    pub fn job_prefix(&self, billing_account_id: &str, iteration: i64) -> String {
        match self {
            ExternalStage::ToBucket => format!("ext-to-bucket-{billing_account_id}-{iteration}-"),
            ExternalStage::FromBucket => {
                format!("ext-from-bucket-{billing_account_id}-{iteration}-")
            }
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            ExternalStage::ToBucket => crate::paths::EXTERNAL_TO_BUCKET,
            ExternalStage::FromBucket => crate::paths::EXTERNAL_FROM_BUCKET,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExternalStage::ToBucket => "to-bucket",
            ExternalStage::FromBucket => "from-bucket",
        }
    }
}

pub fn local_to_tmp_prefix(billing_account_id: &str, iteration: i64) -> String {
    format!("int-local-to-tmp-{billing_account_id}-{iteration}-")
}

pub fn copy_to_unified_prefix(iteration: i64) -> String {
    format!("int-copy-to-unified-{iteration}-")
}

pub fn delete_from_unified_prefix(billing_account_id: &str) -> String {
    format!("int-delete-from-unified-{billing_account_id}-")
}
