use axum::{extract::State, http::Uri, response::IntoResponse, Json};
use billing_domain::StageRequest;
use billing_worker::StageHandler;

use crate::{error::ApiResult, response::success, routes::AppState};

/// 任务队列回调, 按请求路径交给对应的阶段
pub async fn handle_stage(
    State(state): State<AppState>,
    uri: Uri,
    Json(request): Json<StageRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.stage_worker.handle(uri.path(), &request).await?;
    Ok(success(outcome))
}
