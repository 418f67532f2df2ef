use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{TaskQueue, TaskRequest, TaskSource};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

/// 内存任务队列实现
///
/// 每个队列一对 Tokio channel, 供嵌入式部署和测试使用。
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    /// 队列名 -> 通道
    queues: Arc<RwLock<HashMap<String, QueueChannels>>>,
}

#[derive(Debug)]
struct QueueChannels {
    sender: mpsc::UnboundedSender<TaskRequest>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<TaskRequest>>>,
    size: Arc<AtomicU32>,
}

impl QueueChannels {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            size: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total_queues: usize,
    pub total_messages: u32,
    pub queue_sizes: HashMap<String, u32>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        info!("创建内存任务队列");
        Self::default()
    }

    async fn channels(&self, queue: &str) -> (mpsc::UnboundedSender<TaskRequest>, Arc<AtomicU32>) {
        {
            let queues = self.queues.read().await;
            if let Some(channels) = queues.get(queue) {
                return (channels.sender.clone(), channels.size.clone());
            }
        }
        let mut queues = self.queues.write().await;
        let channels = queues
            .entry(queue.to_string())
            .or_insert_with(QueueChannels::new);
        (channels.sender.clone(), channels.size.clone())
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        let queues = self.queues.read().await;
        let mut stats = QueueStats {
            total_queues: queues.len(),
            ..Default::default()
        };
        for (name, channels) in queues.iter() {
            let size = channels.size.load(Ordering::Relaxed);
            stats.total_messages += size;
            stats.queue_sizes.insert(name.clone(), size);
        }
        stats
    }

    pub async fn queue_size(&self, queue: &str) -> u32 {
        self.queues
            .read()
            .await
            .get(queue)
            .map(|c| c.size.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, request: TaskRequest) -> PipelineResult<()> {
        let (sender, size) = self.channels(&request.queue).await;
        debug!("入队 {} -> {}", request.path, request.queue);
        sender
            .send(request)
            .map_err(|e| PipelineError::TaskQueue(format!("发送任务失败: {e}")))?;
        size.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl TaskSource for InMemoryTaskQueue {
    async fn next(&self, queue: &str) -> PipelineResult<Option<TaskRequest>> {
        let (receiver, size) = {
            let queues = self.queues.read().await;
            match queues.get(queue) {
                Some(channels) => (channels.receiver.clone(), channels.size.clone()),
                None => return Ok(None),
            }
        };
        let mut receiver = receiver.lock().await;
        match receiver.try_recv() {
            Ok(request) => {
                size.fetch_sub(1, Ordering::Relaxed);
                Ok(Some(request))
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(PipelineError::TaskQueue(format!("队列已关闭: {queue}")))
            }
        }
    }
}
