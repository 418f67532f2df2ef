use axum::{
    routing::{get, post},
    Router,
};
use billing_domain::{paths, PipelineContext};
use billing_worker::StageWorker;

use crate::handlers::{
    accounts::{offboard, onboard, reset_all},
    health::health_check,
    managers::{run_external_cycle, run_internal_cycle},
    reconciliation::{run_monitor, sanity_check},
    stages::handle_stage,
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub ctx: PipelineContext,
    pub stage_worker: StageWorker,
}

impl AppState {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            stage_worker: StageWorker::new(ctx.clone()),
            ctx,
        }
    }
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // 管理器周期
        .route("/managers/internal/run", post(run_internal_cycle))
        .route("/managers/external/run", post(run_external_cycle))
        // 阶段工作器
        .route(paths::INTERNAL_TASK, post(handle_stage))
        .route(paths::EXTERNAL_TO_BUCKET, post(handle_stage))
        .route(paths::EXTERNAL_FROM_BUCKET, post(handle_stage))
        // 账户接入与下线
        .route("/accounts/onboard", post(onboard))
        .route("/accounts/offboard", post(offboard))
        .route("/admin/reset", post(reset_all))
        // 对账
        .route("/reconciliation/monitor", post(run_monitor))
        .route("/reconciliation/sanity-check", post(sanity_check))
        .with_state(state)
}
