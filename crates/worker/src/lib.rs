//! 阶段工作器
//!
//! 管理器把每个账户的阶段请求放进任务队列, 工作器取出后提交对应的仓库作业并记录作业ID。

pub mod components;
pub mod stage_worker;

pub use components::QueueConsumer;
pub use stage_worker::{StageHandler, StageKind, StageOutcome, StageWorker};
