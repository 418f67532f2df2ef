use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use billing_api::create_app;
use billing_core::{AppConfig, PipelineError};
use billing_dispatcher::{ExternalManager, InternalManager};
use billing_domain::PipelineContext;
use billing_infrastructure::{
    InMemoryBillingEvents, InMemoryBillingTables, InMemoryMetadata, InMemoryObjectStore,
    InMemoryTaskQueue, InMemoryWarehouse, RecordingNotificationSink,
};
use billing_worker::{QueueConsumer, StageWorker};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 定时执行管理器周期
    Dispatcher,
    /// 消费阶段请求队列
    Worker,
    /// 仅运行API服务器
    Api,
    /// 运行所有组件
    All,
}

impl AppMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "dispatcher" => Ok(AppMode::Dispatcher),
            "worker" => Ok(AppMode::Worker),
            "api" => Ok(AppMode::Api),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
        }
    }

    fn runs(&self, component: AppMode) -> bool {
        *self == AppMode::All || *self == component
    }
}

/// 主应用程序
///
/// 嵌入式运行时所有端口都接到内存实现上, 仓库作业按默认行为立即完成。
pub struct Application {
    ctx: PipelineContext,
    queue: Arc<InMemoryTaskQueue>,
    mode: AppMode,
    cycle_interval: Duration,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode, cycle_interval: Duration) -> Self {
        info!("初始化应用程序, 模式: {:?}", mode);
        let queue = Arc::new(InMemoryTaskQueue::new());
        Self {
            ctx: embedded_context(config, queue.clone()),
            queue,
            mode,
            cycle_interval,
        }
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut handles = Vec::new();

        if self.mode.runs(AppMode::Dispatcher) {
            let ctx = self.ctx.clone();
            let interval = self.cycle_interval;
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                run_manager_loop(ctx, interval, shutdown_rx).await;
            }));
        }

        let consumer = if self.mode.runs(AppMode::Worker) {
            let consumer = self.consumer();
            consumer.start().await?;
            Some(consumer)
        } else {
            None
        };

        if self.mode.runs(AppMode::Api) && self.ctx.config.api.enabled {
            self.run_api(shutdown_rx.resubscribe()).await?;
        } else {
            let mut shutdown_rx = shutdown_rx.resubscribe();
            let _ = shutdown_rx.recv().await;
        }

        if let Some(consumer) = consumer {
            consumer.stop().await?;
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("所有组件已停止");
        Ok(())
    }

    fn consumer(&self) -> QueueConsumer {
        let queues = &self.ctx.config.queues;
        QueueConsumer::new(
            "embedded",
            self.queue.clone(),
            Arc::new(StageWorker::new(self.ctx.clone())),
            vec![queues.internal_tasks.clone(), queues.external_tasks.clone()],
            Duration::from_secs(1),
        )
    }

    async fn run_api(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let bind_address = self.ctx.config.api.bind_address.clone();
        let listener = TcpListener::bind(&bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {bind_address}"))?;
        info!("API服务器启动在 http://{}", bind_address);

        axum::serve(listener, create_app(self.ctx.clone()).into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("API服务器收到关闭信号");
            })
            .await
            .context("API服务器运行失败")?;
        Ok(())
    }
}

/// 按固定间隔依次执行外部和内部管理器周期
async fn run_manager_loop(
    ctx: PipelineContext,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let external = ExternalManager::new(ctx.clone());
    let internal = InternalManager::new(ctx);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match external.run_cycle().await {
                    Ok(report) => info!("外部管理器迭代 {} 完成", report.iteration),
                    Err(e @ PipelineError::LeaseHeld { .. }) => {
                        warn!("外部管理器跳过本轮: {}", e)
                    }
                    Err(e) => error!("外部管理器周期失败: {}", e),
                }
                match internal.run_cycle().await {
                    Ok(report) => info!("内部管理器迭代 {} 完成", report.iteration),
                    Err(e) => error!("内部管理器周期失败: {}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("管理器循环收到关闭信号");
                break;
            }
        }
    }
}

fn embedded_context(config: AppConfig, queue: Arc<InMemoryTaskQueue>) -> PipelineContext {
    let metadata = InMemoryMetadata::new(config.metadata.transaction_max_attempts);
    let tables = Arc::new(InMemoryBillingTables::new());
    let bucket = Arc::new(InMemoryObjectStore::new());
    let warehouse = InMemoryWarehouse::new()
        .with_tables(tables.clone())
        .with_bucket(bucket.clone());

    PipelineContext {
        store: metadata.store(),
        warehouse: Arc::new(warehouse),
        tables,
        queue,
        bucket,
        notifier: Arc::new(RecordingNotificationSink::new()),
        events: Arc::new(InMemoryBillingEvents::new()),
        config: Arc::new(config),
    }
}
