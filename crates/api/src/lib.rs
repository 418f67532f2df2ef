//! # Billing API
//!
//! 运维操作的 HTTP 接口, 基于 Axum。每个请求只做一件事, 成功或失败通过状态码返回。
//!
//! ## API 端点
//!
//! ### 管理器
//! - `POST /managers/internal/run` - 执行一轮内部管理器周期
//! - `POST /managers/external/run` - 执行一轮外部管理器周期
//!
//! ### 阶段工作器 (任务队列回调)
//! - `POST /tasks/internal` - 提交本地表到临时表的拷贝作业
//! - `POST /tasks/external/to-bucket` - 提交导出作业
//! - `POST /tasks/external/from-bucket` - 提交导入作业
//!
//! ### 账户
//! - `POST /accounts/onboard` - 接入账户
//! - `POST /accounts/offboard` - 下线账户
//! - `POST /admin/reset` - 清空全部元数据并重建管理器文档
//!
//! ### 对账
//! - `POST /reconciliation/monitor` - 对单个账户执行默认窗口对账
//! - `POST /reconciliation/sanity-check` - 对所有活跃账户做全量对账
//!
//! ### 健康检查
//! - `GET /health`

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use billing_domain::PipelineContext;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};
use routes::{create_routes, AppState};

pub use error::{ApiError, ApiResult};
pub use response::ApiResponse;

/// 创建完整的API应用
pub fn create_app(ctx: PipelineContext) -> Router {
    create_routes(AppState::new(ctx)).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}
