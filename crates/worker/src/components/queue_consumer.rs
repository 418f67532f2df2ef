use std::sync::Arc;
use std::time::Duration;

use billing_core::{PipelineError, PipelineResult};
use billing_domain::{StageRequest, TaskRequest, TaskSource};
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::stage_worker::{StageHandler, StageOutcome};

/// 从任务队列拉取阶段请求并交给处理器
pub struct QueueConsumer {
    name: String,
    source: Arc<dyn TaskSource>,
    handler: Arc<dyn StageHandler>,
    queues: Vec<String>,
    poll_interval: Duration,
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    is_running: Arc<RwLock<bool>>,
}

impl QueueConsumer {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn TaskSource>,
        handler: Arc<dyn StageHandler>,
        queues: Vec<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            handler,
            queues,
            poll_interval,
            shutdown_tx: Arc::new(RwLock::new(None)),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(&self) -> PipelineResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(PipelineError::internal(format!(
                "消费者 {} 已经在运行",
                self.name
            )));
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let mut poll_interval = interval(self.poll_interval);
        let source = Arc::clone(&self.source);
        let handler = Arc::clone(&self.handler);
        let queues = self.queues.clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = poll_interval.tick() => {
                        if let Err(e) = Self::drain(source.as_ref(), handler.as_ref(), &queues).await {
                            error!("消费者 {} 拉取任务失败: {}", name, e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("消费者 {} 停止拉取", name);
                        break;
                    }
                }
            }
        });

        *is_running = true;
        info!("消费者 {} 开始拉取队列 {:?}", self.name, self.queues);
        Ok(())
    }

    pub async fn stop(&self) -> PipelineResult<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Ok(());
        }
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        *is_running = false;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// 处理所有队列中现有的请求, 返回处理的个数
    pub async fn drain_once(&self) -> PipelineResult<usize> {
        Self::drain(self.source.as_ref(), self.handler.as_ref(), &self.queues).await
    }

    async fn drain(
        source: &dyn TaskSource,
        handler: &dyn StageHandler,
        queues: &[String],
    ) -> PipelineResult<usize> {
        let mut handled = 0;
        for queue in queues {
            while let Some(request) = source.next(queue).await? {
                Self::process(handler, &request).await;
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// 单个请求的失败只记录日志, 不影响后续请求
    async fn process(handler: &dyn StageHandler, request: &TaskRequest) {
        let stage_request = match serde_json::from_value::<StageRequest>(request.body.clone()) {
            Ok(stage_request) => stage_request,
            Err(e) => {
                error!("无法解析 {} 的请求体: {}", request.path, e);
                return;
            }
        };

        match handler.handle(&request.path, &stage_request).await {
            Ok(StageOutcome::Submitted { job_id }) => {
                debug!("{} -> 作业 {}", request.path, job_id);
            }
            Ok(StageOutcome::Skipped { state }) => {
                debug!(
                    "账户 {} 处于 {}, 跳过 {}",
                    stage_request.billing_account_id, state, request.path
                );
            }
            Err(e) if e.is_stale_iteration() => {
                warn!(
                    "账户 {} 的请求迭代 {} 已过期: {}",
                    stage_request.billing_account_id, stage_request.iteration, e
                );
            }
            Err(e) => {
                error!(
                    "处理账户 {} 的 {} 失败: {}",
                    stage_request.billing_account_id, request.path, e
                );
            }
        }
    }
}
