pub mod config;
pub mod errors;
pub mod logging;
pub mod models;

pub use config::{AppConfig, ConfigValidator};
pub use errors::{PipelineError, PipelineResult};
pub use logging::init_logging;
pub use models::*;
