use async_trait::async_trait;
use billing_core::PipelineResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

/// 分发给阶段工作器的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: serde_json::Value,
    pub queue: String,
}

impl TaskRequest {
    pub fn post(
        queue: impl Into<String>,
        path: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            body,
            queue: queue.into(),
        }
    }
}

/// 阶段工作器的请求体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRequest {
    pub billing_account_id: String,
    pub iteration: i64,
}

pub mod paths {
    pub const INTERNAL_TASK: &str = "/tasks/internal";
    pub const EXTERNAL_TO_BUCKET: &str = "/tasks/external/to-bucket";
    pub const EXTERNAL_FROM_BUCKET: &str = "/tasks/external/from-bucket";
}

/// 任务队列, 至少一次投递
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, request: TaskRequest) -> PipelineResult<()>;
}

/// 拉取式消费端
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn next(&self, queue: &str) -> PipelineResult<Option<TaskRequest>>;
}
