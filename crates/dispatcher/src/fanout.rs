use std::future::Future;

use billing_core::{PipelineError, PipelineResult};
use tokio::task::JoinSet;
use tracing::error;

/// 按账户并发执行的结果
#[derive(Debug)]
pub struct FanOutReport<T> {
    pub succeeded: Vec<(String, T)>,
    pub failed: Vec<(String, PipelineError)>,
    pub panicked: usize,
}

impl<T> Default for FanOutReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            panicked: 0,
        }
    }
}

impl<T> FanOutReport<T> {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.panicked == 0
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.panicked
    }
}

/// 每个账户一个任务, 在屏障处汇总各自的结果
pub async fn fan_out<T, F, Fut>(keys: impl IntoIterator<Item = String>, work: F) -> FanOutReport<T>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = PipelineResult<T>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for key in keys {
        let fut = work(key.clone());
        set.spawn(async move { (key, fut.await) });
    }

    let mut report = FanOutReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((key, Ok(value))) => report.succeeded.push((key, value)),
            Ok((key, Err(e))) => report.failed.push((key, e)),
            Err(e) => {
                error!("账户任务异常退出: {}", e);
                report.panicked += 1;
            }
        }
    }
    report
}
