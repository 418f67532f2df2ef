//! 领域端口
//!
//! 流水线依赖的所有外部协作者都以异步 trait 的形式定义在这里。

pub mod context;
pub mod events;
pub mod job_naming;
pub mod messaging;
pub mod metadata_store;
pub mod notification;
pub mod storage;
pub mod tables;
pub mod warehouse;

pub use context::PipelineContext;
pub use events::*;
pub use job_naming::*;
pub use messaging::*;
pub use metadata_store::*;
pub use notification::*;
pub use storage::*;
pub use tables::*;
pub use warehouse::*;
