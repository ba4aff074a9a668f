//! Job queue interface and an in-process implementation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::JobError;

/// Queue entry: a pointer to a stored job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddJobOptions {
    /// At most one pending delivery per key.
    pub job_key: Option<String>,
    /// Deliver no earlier than this.
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn add_job(
        &self,
        identifier: &str,
        job: QueuedJob,
        options: AddJobOptions,
    ) -> Result<(), JobError>;
}

/// Queue backed by an unbounded mpsc channel; delayed jobs are held by a timer task.
pub struct InMemoryJobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
    pending_keys: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryJobQueue {
    /// Create the queue and the receiver a worker consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<QueuedJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending_keys: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    fn deliver(
        tx: &mpsc::UnboundedSender<QueuedJob>,
        keys: &Mutex<HashSet<String>>,
        job: QueuedJob,
        key: Option<&str>,
    ) -> Result<(), JobError> {
        if let Some(key) = key {
            keys.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        }
        let id = job.job_id;
        tx.send(job).map_err(|_| JobError::EnqueueFailed {
            id,
            reason: "queue receiver dropped".to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn add_job(
        &self,
        identifier: &str,
        job: QueuedJob,
        options: AddJobOptions,
    ) -> Result<(), JobError> {
        if let Some(key) = &options.job_key {
            let mut keys = self.pending_keys.lock().unwrap_or_else(|e| e.into_inner());
            if !keys.insert(key.clone()) {
                tracing::debug!(job_id = %job.job_id, job_key = %key, "Job already pending, skipping");
                return Ok(());
            }
        }

        let delay = options
            .run_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .filter(|d| !d.is_zero());

        let Some(delay) = delay else {
            tracing::debug!(job_id = %job.job_id, identifier, "Job enqueued");
            return Self::deliver(&self.tx, &self.pending_keys, job, options.job_key.as_deref());
        };

        if self.tx.is_closed() {
            return Err(JobError::EnqueueFailed {
                id: job.job_id,
                reason: "queue receiver dropped".to_string(),
            });
        }

        tracing::debug!(job_id = %job.job_id, identifier, ?delay, "Job scheduled");
        let tx = self.tx.clone();
        let keys = Arc::clone(&self.pending_keys);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = Self::deliver(&tx, &keys, job, options.job_key.as_deref()) {
                tracing::warn!("Delayed job dropped: {}", e);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn immediate_jobs_arrive_in_order() {
        let (queue, mut rx) = InMemoryJobQueue::channel();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue
                .add_job("run", QueuedJob { job_id: *id }, AddJobOptions::default())
                .await
                .unwrap();
        }
        for id in ids {
            assert_eq!(rx.recv().await.unwrap().job_id, id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_waits_for_run_at() {
        let (queue, mut rx) = InMemoryJobQueue::channel();
        let id = Uuid::new_v4();
        queue
            .add_job(
                "run",
                QueuedJob { job_id: id },
                AddJobOptions {
                    run_at: Some(Utc::now() + chrono::Duration::seconds(10)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .is_err()
        );
        let job = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.job_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn job_key_deduplicates_pending_deliveries() {
        let (queue, mut rx) = InMemoryJobQueue::channel();
        let id = Uuid::new_v4();
        let options = AddJobOptions {
            job_key: Some(id.to_string()),
            run_at: Some(Utc::now() + chrono::Duration::seconds(1)),
            max_attempts: None,
        };
        queue
            .add_job("run", QueuedJob { job_id: id }, options.clone())
            .await
            .unwrap();
        queue
            .add_job("run", QueuedJob { job_id: id }, options)
            .await
            .unwrap();

        assert!(rx.recv().await.is_some());
        assert!(
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn dropped_receiver_fails_enqueue() {
        let (queue, rx) = InMemoryJobQueue::channel();
        drop(rx);
        let err = queue
            .add_job(
                "run",
                QueuedJob {
                    job_id: Uuid::new_v4(),
                },
                AddJobOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::EnqueueFailed { .. }));
    }
}
