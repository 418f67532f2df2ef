//! # Billing Testing Utils
//!
//! 各个 crate 共用的测试工具。
//!
//! - **Builders**: 带合理默认值的元数据文档构造器
//! - **Harness**: 连接所有内存适配器的流水线上下文, 可选后台阶段工作器
//! - **Helpers**: 条件等待, 时间解析和快速配置
//!
//! ```toml
//! [dev-dependencies]
//! billing-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod harness;
pub mod helpers;

pub use builders::*;
pub use harness::*;
pub use helpers::*;
