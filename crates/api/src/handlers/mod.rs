pub mod accounts;
pub mod health;
pub mod managers;
pub mod reconciliation;
pub mod stages;

use serde::Deserialize;

use crate::error::{ApiError, ApiResult};

/// 只带账户ID的请求体
#[derive(Debug, Deserialize)]
pub struct AccountRequest {
    pub billing_account_id: String,
}

impl AccountRequest {
    pub fn account(&self) -> ApiResult<&str> {
        let account = self.billing_account_id.trim();
        if account.is_empty() {
            return Err(ApiError::BadRequest("billing_account_id 不能为空".to_string()));
        }
        Ok(account)
    }
}
