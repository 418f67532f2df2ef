use axum::{
    body::{to_bytes, Body},
    extract::Request,
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use billing_domain::paths;
use serde_json::Value;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, info_span, warn, Instrument};

/// 运维请求体都很小, 超过这个大小直接拒绝
const MAX_BODY_BYTES: usize = 64 * 1024;

/// 按路径归类的运维操作, 作为日志字段
pub fn operation_for(path: &str) -> &'static str {
    match path {
        "/health" => "health",
        "/managers/internal/run" => "manager.internal",
        "/managers/external/run" => "manager.external",
        paths::INTERNAL_TASK => "stage.internal",
        paths::EXTERNAL_TO_BUCKET => "stage.to_bucket",
        paths::EXTERNAL_FROM_BUCKET => "stage.from_bucket",
        "/accounts/onboard" => "account.onboard",
        "/accounts/offboard" => "account.offboard",
        "/admin/reset" => "admin.reset",
        "/reconciliation/monitor" => "reconciliation.monitor",
        "/reconciliation/sanity-check" => "reconciliation.sanity_check",
        _ => "unknown",
    }
}

fn account_of(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(body)
        .ok()?
        .get("billing_account_id")?
        .as_str()
        .map(str::to_string)
}

/// 记录每个请求的操作、账户和耗时
///
/// 请求体会被完整读出用于提取账户ID, 然后原样交给处理器。
pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let operation = operation_for(&path);

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("读取请求体失败: {} {} - {}", method, path, e);
            return (StatusCode::PAYLOAD_TOO_LARGE, "请求体过大").into_response();
        }
    };
    let account = account_of(&bytes).unwrap_or_default();
    let request = Request::from_parts(parts, Body::from(bytes));

    let span = info_span!("operator_request", %method, operation, account = %account);
    async move {
        let start = std::time::Instant::now();
        let response = next.run(request).await;
        let status = response.status();
        let elapsed = start.elapsed();
        if status.is_client_error() || status.is_server_error() {
            warn!("{} {} 失败 - 状态: {} - 耗时: {:?}", method, path, status, elapsed);
        } else {
            info!("{} {} 完成 - 状态: {} - 耗时: {:?}", method, path, status, elapsed);
        }
        response
    }
    .instrument(span)
    .await
}

/// 只开放运维需要的 GET 和 POST
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_paths_have_operations() {
        assert_eq!(operation_for(paths::INTERNAL_TASK), "stage.internal");
        assert_eq!(operation_for(paths::EXTERNAL_TO_BUCKET), "stage.to_bucket");
        assert_eq!(operation_for(paths::EXTERNAL_FROM_BUCKET), "stage.from_bucket");
        assert_eq!(operation_for("/managers/internal/run"), "manager.internal");
        assert_eq!(operation_for("/nope"), "unknown");
    }

    #[test]
    fn test_account_is_read_from_body() {
        let body = br#"{"billing_account_id": "AAA-111", "iteration": 2}"#;
        assert_eq!(account_of(body), Some("AAA-111".to_string()));
        assert_eq!(account_of(b""), None);
        assert_eq!(account_of(br#"{"iteration": 2}"#), None);
    }
}
