use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl ApiResponse<()> {
    pub fn success_empty_with_message(message: String) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(message),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

pub fn success<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, ApiResponse::success(data))
}

pub fn created<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::CREATED, ApiResponse::success(data))
}

pub fn accepted(message: String) -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        ApiResponse::success_empty_with_message(message),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("AAA-111");

        assert!(response.success);
        assert_eq!(response.data, Some("AAA-111"));
        assert!(response.message.is_none());
        assert!(response.timestamp <= Utc::now());
    }

    #[test]
    fn test_empty_response_serializes_null_data() {
        let response = ApiResponse::success_empty_with_message("已下线".to_string());
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["success"], true);
        assert!(value["data"].is_null());
        assert_eq!(value["message"], "已下线");
    }
}
