use axum::{extract::State, response::IntoResponse, Json};
use billing_dispatcher::ReconciliationMonitor;

use super::AccountRequest;
use crate::{error::ApiResult, response::success, routes::AppState};

pub async fn run_monitor(
    State(state): State<AppState>,
    Json(request): Json<AccountRequest>,
) -> ApiResult<impl IntoResponse> {
    let account = request.account()?;
    let report = ReconciliationMonitor::new(state.ctx.clone())
        .run_monitor(account)
        .await?;
    Ok(success(report))
}

/// 全量对账可能很慢, 调用方需要自行设置足够的超时
pub async fn sanity_check(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let results = ReconciliationMonitor::new(state.ctx.clone())
        .sanity_check_all()
        .await?;
    Ok(success(results))
}
