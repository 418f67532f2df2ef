//! Test data builders for metadata documents
//!
//! 默认值对应一个已经完成首次拷贝的活跃账户。

use billing_core::models::{
    BillingTableInfo, BucketData, CopyHistory, CopyHistoryStatus, ExternalTaskJobs,
    ExternalTaskMetadata, ExternalTaskState, InternalTaskJobs, InternalTaskMetadata,
    InternalTaskState, Job, JobStatus, LifecycleStage, ManagerMetadata, ManagerState, Segment,
};
use billing_domain::bucket_name;
use chrono::{DateTime, Utc};

use crate::helpers::at;

/// Builder for external task documents
pub struct ExternalTaskBuilder {
    task: ExternalTaskMetadata,
}

impl ExternalTaskBuilder {
    pub fn new(billing_account_id: &str) -> Self {
        Self {
            task: ExternalTaskMetadata {
                billing_account_id: billing_account_id.to_string(),
                customer_id: format!("customer-{billing_account_id}"),
                state: ExternalTaskState::Pending,
                iteration: 0,
                jobs: ExternalTaskJobs::default(),
                segment: None,
                bucket: BucketData::cleared(bucket_name(billing_account_id)),
                onboarding: false,
                lifecycle_stage: LifecycleStage::Active,
                source_table: BillingTableInfo {
                    project_id: "customer-project".to_string(),
                    dataset_id: "billing".to_string(),
                    table_id: format!("export_{}", billing_account_id.to_lowercase()),
                    location: "US".to_string(),
                },
                last_update: None,
            },
        }
    }

    pub fn with_state(mut self, state: ExternalTaskState) -> Self {
        self.task.state = state;
        self
    }

    pub fn with_iteration(mut self, iteration: i64) -> Self {
        self.task.iteration = iteration;
        self
    }

    pub fn with_segment(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.task.segment = Some(Segment::new(start, end));
        self
    }

    pub fn with_to_bucket_job(mut self, job: Job) -> Self {
        self.task.jobs.to_bucket = Some(job);
        self
    }

    pub fn with_lifecycle(mut self, stage: LifecycleStage) -> Self {
        self.task.lifecycle_stage = stage;
        self
    }

    pub fn onboarding(mut self) -> Self {
        self.task.onboarding = true;
        self.task.lifecycle_stage = LifecycleStage::Created;
        self
    }

    pub fn build(self) -> ExternalTaskMetadata {
        self.task
    }
}

/// Builder for internal task documents
pub struct InternalTaskBuilder {
    task: InternalTaskMetadata,
}

impl InternalTaskBuilder {
    pub fn new(billing_account_id: &str) -> Self {
        Self {
            task: InternalTaskMetadata {
                billing_account_id: billing_account_id.to_string(),
                customer_id: format!("customer-{billing_account_id}"),
                state: InternalTaskState::Done,
                iteration: 0,
                ttl: None,
                jobs: InternalTaskJobs::default(),
                segment: None,
                copy_history: CopyHistory {
                    target_time: at("2024-01-01T00:00:00Z"),
                    status: CopyHistoryStatus::Done,
                },
                lifecycle_stage: LifecycleStage::Active,
                dummy: false,
                onboarding: false,
                oldest_partition: None,
                last_update: None,
            },
        }
    }

    pub fn with_state(mut self, state: InternalTaskState) -> Self {
        self.task.state = state;
        self
    }

    pub fn with_iteration(mut self, iteration: i64) -> Self {
        self.task.iteration = iteration;
        self
    }

    pub fn with_segment(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.task.segment = Some(Segment::new(start, end));
        self
    }

    pub fn with_copy_job(mut self, job: Job) -> Self {
        self.task.jobs.from_local_to_tmp = Some(job);
        self
    }

    pub fn with_lifecycle(mut self, stage: LifecycleStage) -> Self {
        self.task.lifecycle_stage = stage;
        self
    }

    pub fn dummy(mut self) -> Self {
        self.task.dummy = true;
        self
    }

    pub fn onboarding(mut self) -> Self {
        self.task.onboarding = true;
        self.task.state = InternalTaskState::Onboarding;
        self.task.lifecycle_stage = LifecycleStage::Created;
        self
    }

    pub fn build(self) -> InternalTaskMetadata {
        self.task
    }
}

/// Builder for manager singleton documents
pub struct ManagerMetadataBuilder {
    manager: ManagerMetadata,
}

impl ManagerMetadataBuilder {
    pub fn new() -> Self {
        Self {
            manager: ManagerMetadata::default(),
        }
    }

    pub fn with_iteration(mut self, iteration: i64) -> Self {
        self.manager.iteration = iteration;
        self
    }

    pub fn with_state(mut self, state: ManagerState) -> Self {
        self.manager.state = state;
        self
    }

    pub fn with_ttl(mut self, ttl: DateTime<Utc>) -> Self {
        self.manager.ttl = Some(ttl);
        self
    }

    /// 已提交但结果未确认的汇总作业
    pub fn with_aggregate_job(mut self, job_id: Option<&str>, finish_by: DateTime<Utc>) -> Self {
        self.manager.aggregate_job = Some(Job {
            job_id: job_id.map(str::to_string),
            status: if job_id.is_some() {
                JobStatus::Created
            } else {
                JobStatus::Pending
            },
            wait_to_start_timeout: Some(finish_by),
            wait_to_finish_timeout: Some(finish_by),
        });
        self
    }

    pub fn recovering_until(mut self, ttl: DateTime<Utc>) -> Self {
        self.manager.recovery.recovering = true;
        self.manager.recovery.recovering_ttl = Some(ttl);
        self.manager.recovery.iteration = self.manager.iteration;
        self
    }

    pub fn build(self) -> ManagerMetadata {
        self.manager
    }
}

impl Default for ManagerMetadataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_onboarding_builders_start_created() {
        let external = ExternalTaskBuilder::new("AAA-111").onboarding().build();
        assert!(external.onboarding);
        assert_eq!(external.lifecycle_stage, LifecycleStage::Created);
        assert_eq!(external.bucket.bucket_name, "billing-staging-aaa-111");

        let internal = InternalTaskBuilder::new("AAA-111").onboarding().build();
        assert_eq!(internal.state, InternalTaskState::Onboarding);
    }

    #[test]
    fn test_manager_builder_arms_aggregate_job() {
        let finish_by = at("2024-01-01T01:00:00Z");
        let manager = ManagerMetadataBuilder::new()
            .with_iteration(4)
            .with_state(ManagerState::Marked)
            .with_aggregate_job(Some("job-1"), finish_by)
            .build();
        let job = manager.aggregate_job.unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.deadlines().unwrap().1, finish_by);
    }
}
