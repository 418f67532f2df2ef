use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use billing_core::PipelineError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("流水线错误: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Pipeline(e) => match e {
                PipelineError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                PipelineError::AlreadyExists { .. } => (StatusCode::CONFLICT, "ALREADY_EXISTS"),
                PipelineError::LeaseHeld { .. } => (StatusCode::CONFLICT, "LEASE_HELD"),
                PipelineError::RecoveryInProgress => {
                    (StatusCode::CONFLICT, "RECOVERY_IN_PROGRESS")
                }
                PipelineError::RecoveryIncomplete { .. } => {
                    (StatusCode::CONFLICT, "RECOVERY_INCOMPLETE")
                }
                PipelineError::StaleIteration { .. } => {
                    (StatusCode::CONFLICT, "STALE_ITERATION")
                }
                PipelineError::TransactionConflict { .. } => {
                    (StatusCode::CONFLICT, "TRANSACTION_CONFLICT")
                }
                PipelineError::InvalidMetadataState(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_METADATA_STATE")
                }
                PipelineError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.classify();
        if status.is_server_error() {
            error!("请求处理失败: {}", self);
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_errors_map_to_status_codes() {
        let cases = vec![
            (PipelineError::not_found("AAA-111"), StatusCode::NOT_FOUND),
            (
                PipelineError::AlreadyExists {
                    key: "AAA-111".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                PipelineError::LeaseHeld {
                    iteration: 3,
                    remaining_seconds: 120,
                },
                StatusCode::CONFLICT,
            ),
            (PipelineError::stale_iteration(3, 4), StatusCode::CONFLICT),
            (
                PipelineError::RecoveryIncomplete {
                    iteration: 3,
                    state: "failed".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                PipelineError::invalid_state("缺少时间段"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                PipelineError::warehouse("quota exceeded"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_bad_request() {
        let response = ApiError::BadRequest("缺少账户ID".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_display_wraps_pipeline_error() {
        let err = ApiError::from(PipelineError::RecoveryInProgress);
        assert_eq!(err.to_string(), "流水线错误: 另一个恢复流程正在进行中");
    }
}
