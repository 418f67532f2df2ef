use axum::{extract::State, response::IntoResponse, Json};
use billing_dispatcher::{Onboarding, OnboardingRequest};
use tracing::{info, warn};

use super::AccountRequest;
use crate::{
    error::ApiResult,
    response::{accepted, created},
    routes::AppState,
};

/// 接入账户, 失败时已完成的步骤会被回滚
pub async fn onboard(
    State(state): State<AppState>,
    Json(request): Json<OnboardingRequest>,
) -> ApiResult<impl IntoResponse> {
    let report = Onboarding::new(state.ctx.clone()).onboard(&request).await?;
    info!("账户 {} 接入完成", request.billing_account_id);
    Ok(created(report))
}

pub async fn offboard(
    State(state): State<AppState>,
    Json(request): Json<AccountRequest>,
) -> ApiResult<impl IntoResponse> {
    let account = request.account()?;
    Onboarding::new(state.ctx.clone()).offboard(account).await?;
    Ok(accepted(format!("账户 {account} 已标记为下线")))
}

pub async fn reset_all(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    warn!("清空全部元数据");
    Onboarding::new(state.ctx.clone()).reset_all().await?;
    Ok(accepted("元数据已重置".to_string()))
}
