//! Job persistence.
//!
//! The store is the single source of truth for job status. Every status change
//! goes through [`JobStore::transition`], a compare-and-set on the current
//! status, so concurrent workers racing on one job cannot both win.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::model::{Job, JobStatus, JobUpdate};
use crate::error::JobError;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<(), JobError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobError>;

    /// Apply `update` only if the job's current status is one of `expected`.
    ///
    /// Returns the updated job, or `None` when the precondition failed.
    async fn transition(
        &self,
        id: Uuid,
        expected: &[JobStatus],
        update: JobUpdate,
    ) -> Result<Option<Job>, JobError>;

    /// Resolve a pending approval. Approval reschedules the job, rejection fails it.
    ///
    /// Returns `None` when the job was not waiting for approval.
    async fn record_approval(&self, id: Uuid, approved: bool) -> Result<Option<Job>, JobError>;
}

/// Job store held in process memory.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All jobs currently in `status`.
    pub async fn list_by_status(&self, status: JobStatus) -> Vec<Job> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect()
    }

    /// Fail every approval wait that expired before `now`. Returns the number expired.
    pub async fn expire_approvals(&self, now: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().await;
        let mut expired = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::WaitingForApproval
                && job.approval_expires_at.is_some_and(|at| at <= now)
            {
                job.apply(JobUpdate::to(JobStatus::Failed).with_error("approval expired"));
                expired += 1;
                tracing::info!(job_id = %job.id, "Approval wait expired");
            }
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), JobError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(JobError::Store(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: &[JobStatus],
        update: JobUpdate,
    ) -> Result<Option<Job>, JobError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;

        if !expected.contains(&job.status) {
            tracing::debug!(
                job_id = %id,
                status = %job.status,
                target = %update.status,
                "Transition precondition failed"
            );
            return Ok(None);
        }
        if !job.status.can_transition_to(update.status) {
            return Err(JobError::InvalidTransition {
                id,
                state: job.status.to_string(),
                target: update.status.to_string(),
            });
        }

        job.apply(update);
        Ok(Some(job.clone()))
    }

    async fn record_approval(&self, id: Uuid, approved: bool) -> Result<Option<Job>, JobError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
        if job.status != JobStatus::WaitingForApproval {
            return Ok(None);
        }

        if approved {
            job.approved_at = Some(Utc::now());
            job.apply(JobUpdate::to(JobStatus::Scheduled));
            tracing::info!(job_id = %id, "Job approved");
        } else {
            job.apply(JobUpdate::to(JobStatus::Failed).with_error("approval rejected"));
            tracing::info!(job_id = %id, "Job rejected");
        }
        Ok(Some(job.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GoalType, TaskInstruction};
    use crate::jobs::model::JobPayload;
    use chrono::Duration as ChronoDuration;

    fn job() -> Job {
        Job::new(
            "job",
            JobPayload::new(
                "agent",
                TaskInstruction {
                    prompt: "p".into(),
                    goal_type: GoalType::Chat,
                    target_files: vec![],
                    prior_turns: vec![],
                },
            ),
            3,
        )
    }

    #[tokio::test]
    async fn conditional_transition_has_one_winner() {
        let store = InMemoryJobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await.unwrap();

        let first = store
            .transition(id, &[JobStatus::Scheduled], JobUpdate::start_attempt())
            .await
            .unwrap();
        let second = store
            .transition(id, &[JobStatus::Scheduled], JobUpdate::start_attempt())
            .await
            .unwrap();
        assert_eq!(first.unwrap().attempt, 1);
        assert!(second.is_none());
        assert_eq!(store.get(id).await.unwrap().unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn illegal_transition_is_an_error() {
        let store = InMemoryJobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await.unwrap();

        let err = store
            .transition(id, &[JobStatus::Scheduled], JobUpdate::to(JobStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let err = store
            .transition(Uuid::new_v4(), &[JobStatus::Scheduled], JobUpdate::start_attempt())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotFound { .. }));
    }

    #[tokio::test]
    async fn approval_reschedules_and_rejection_fails() {
        let store = InMemoryJobStore::new();
        let (a, b) = (job(), job());
        let (a_id, b_id) = (a.id, b.id);
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();
        for id in [a_id, b_id] {
            store
                .transition(
                    id,
                    &[JobStatus::Scheduled],
                    JobUpdate::to(JobStatus::WaitingForApproval),
                )
                .await
                .unwrap();
        }

        let approved = store.record_approval(a_id, true).await.unwrap().unwrap();
        assert_eq!(approved.status, JobStatus::Scheduled);
        assert!(approved.is_approved());

        let rejected = store.record_approval(b_id, false).await.unwrap().unwrap();
        assert_eq!(rejected.status, JobStatus::Failed);
        assert_eq!(rejected.error.as_deref(), Some("approval rejected"));

        assert!(store.record_approval(a_id, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_approvals_fail() {
        let store = InMemoryJobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await.unwrap();
        let expires = Utc::now() + ChronoDuration::hours(1);
        store
            .transition(
                id,
                &[JobStatus::Scheduled],
                JobUpdate::to(JobStatus::WaitingForApproval).with_approval_expiry(expires),
            )
            .await
            .unwrap();

        assert_eq!(store.expire_approvals(Utc::now()).await, 0);
        assert_eq!(
            store.expire_approvals(expires + ChronoDuration::seconds(1)).await,
            1
        );
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
    }
}
