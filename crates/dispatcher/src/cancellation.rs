use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 协作式取消作用域
///
/// 子作用域在父作用域取消时一起取消; 带截止时间的作用域由看门狗任务在到期时触发。
/// 最后一个克隆被释放时看门狗随之终止。
#[derive(Debug, Clone)]
pub struct CancellationScope {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    watchdogs: Arc<Vec<Watchdog>>,
}

#[derive(Debug)]
struct Watchdog(JoinHandle<()>);

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Default for CancellationScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationScope {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
            watchdogs: Arc::new(Vec::new()),
        }
    }

    /// 周期级作用域: 到达截止时间时取消
    pub fn until(deadline: DateTime<Utc>) -> Self {
        Self::new().with_deadline(deadline)
    }

    /// 派生一个子作用域, 在父作用域取消或到达 `deadline` 时取消
    pub fn with_deadline(&self, deadline: DateTime<Utc>) -> Self {
        let child = Self::new();
        let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
        let sender = child.sender.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            sender.send_replace(true);
        });
        child.linked_to(self, vec![Watchdog(timer)])
    }

    fn linked_to(self, parent: &CancellationScope, mut watchdogs: Vec<Watchdog>) -> Self {
        let mut parent_rx = parent.receiver.clone();
        let sender = self.sender.clone();
        watchdogs.push(Watchdog(tokio::spawn(async move {
            if parent_rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                sender.send_replace(true);
            }
        })));
        Self {
            watchdogs: Arc::new(watchdogs),
            ..self
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}
