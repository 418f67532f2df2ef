use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

/// 优雅关闭信号
///
/// 关闭后才订阅的接收器会立即收到信号。
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    is_shutdown: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            is_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.is_shutdown() {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            return rx;
        }
        self.shutdown_tx.subscribe()
    }

    /// 通知所有订阅者, 重复调用无效
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("已经触发过关闭");
            return;
        }
        let receivers = self.shutdown_tx.receiver_count();
        let _ = self.shutdown_tx.send(());
        info!("关闭信号已发送给 {} 个订阅者", receivers);
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
