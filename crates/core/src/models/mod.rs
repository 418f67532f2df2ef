pub mod job;
pub mod metadata;
pub mod segment;
pub mod states;

pub use job::{Job, JobStatus};
pub use metadata::{
    ensure_iteration, BillingTableInfo, BucketData, CopyHistory, Document, ExternalTaskJobs,
    ExternalTaskMetadata, InternalTaskJobs, InternalTaskMetadata, Lease, ManagerMetadata,
    ReconciliationCheckpoint, RecoveryInfo,
};
pub use segment::{Segment, EXPORT_TIME_LAYOUT};
pub use states::{
    CopyHistoryStatus, ExternalTaskState, InternalTaskState, LifecycleStage, ManagerState,
};
