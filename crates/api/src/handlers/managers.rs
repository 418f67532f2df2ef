use axum::{extract::State, response::IntoResponse};
use billing_dispatcher::{ExternalManager, InternalManager};
use tracing::info;

use crate::{error::ApiResult, response::success, routes::AppState};

/// 执行一轮内部管理器周期, 返回周期报告
pub async fn run_internal_cycle(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let report = InternalManager::new(state.ctx.clone()).run_cycle().await?;
    info!("内部管理器第 {} 轮周期完成", report.iteration);
    Ok(success(report))
}

/// 执行一轮外部管理器周期
pub async fn run_external_cycle(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let report = ExternalManager::new(state.ctx.clone()).run_cycle().await?;
    info!("外部管理器第 {} 轮周期完成", report.iteration);
    Ok(success(report))
}
