//! 下游账单事件

use async_trait::async_trait;
use billing_core::PipelineResult;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 账户历史数据导入进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    #[default]
    Pending,
    Started,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BillingEvent {
    /// 历史数据拷贝完成
    CopyHistoryFinished {
        billing_account_id: String,
        customer_id: String,
        start_day: NaiveDate,
        end_day: NaiveDate,
    },
    /// 旧分区被回填
    OldPartitionUpdated {
        billing_account_id: String,
        customer_id: String,
        start_day: NaiveDate,
        end_day: NaiveDate,
    },
    /// 账户下线, 统一表中该范围的数据已删除
    Offboarded {
        billing_account_id: String,
        customer_id: String,
        start_day: NaiveDate,
        end_day: NaiveDate,
    },
}

impl BillingEvent {
    pub fn billing_account_id(&self) -> &str {
        match self {
            BillingEvent::CopyHistoryFinished {
                billing_account_id, ..
            }
            | BillingEvent::OldPartitionUpdated {
                billing_account_id, ..
            }
            | BillingEvent::Offboarded {
                billing_account_id, ..
            } => billing_account_id,
        }
    }
}

#[async_trait]
pub trait BillingEvents: Send + Sync {
    async fn publish(&self, event: &BillingEvent) -> PipelineResult<()>;

    async fn import_status(&self, billing_account_id: &str) -> PipelineResult<ImportStatus>;

    async fn set_import_status(
        &self,
        billing_account_id: &str,
        status: ImportStatus,
    ) -> PipelineResult<()>;
}
