use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::job::{JobRecord, now};
use crate::journal::{Journal, Op, Source};

/// A named FIFO of jobs. Every payload is handed to exactly one popper.
pub struct FifoQueue {
    name: String,
    jobs: Mutex<VecDeque<JobRecord>>,
    journal: Option<Arc<Journal>>,
}

impl FifoQueue {
    pub(crate) fn new(
        name: impl Into<String>,
        jobs: VecDeque<JobRecord>,
        journal: Option<Arc<Journal>>,
    ) -> Self {
        Self {
            name: name.into(),
            jobs: Mutex::new(jobs),
            journal,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate a raw payload and append it.
    pub async fn push(&self, payload: &[u8]) -> Result<()> {
        let job = JobRecord::parse(payload)?;
        self.push_job(job).await
    }

    pub async fn push_job(&self, job: JobRecord) -> Result<()> {
        self.insert(job, None).await
    }

    pub(crate) async fn insert(&self, mut job: JobRecord, from: Option<Source>) -> Result<()> {
        job.queue = self.name.clone();
        job.enqueued_at = Some(now());

        let mut jobs = self.jobs.lock().await;
        // journal under the queue lock so replay sees pushes in queue order
        if let Some(journal) = &self.journal {
            journal
                .append(&Op::Push {
                    queue: self.name.clone(),
                    job: job.clone(),
                    from,
                })
                .await?;
        }
        jobs.push_back(job);
        Ok(())
    }

    /// Remove and return the head. `Ok(None)` on an empty queue.
    pub async fn pop(&self) -> Result<Option<JobRecord>> {
        let mut jobs = self.jobs.lock().await;
        let Some(head) = jobs.front() else {
            return Ok(None);
        };
        if let Some(journal) = &self.journal {
            journal
                .append(&Op::Remove {
                    from: Source::Queue {
                        queue: self.name.clone(),
                        jid: head.jid.clone(),
                    },
                })
                .await?;
        }
        Ok(jobs.pop_front())
    }

    /// Detach the head for a move; the destination journals the move.
    pub(crate) async fn take(&self) -> Option<JobRecord> {
        self.jobs.lock().await.pop_front()
    }

    pub(crate) async fn restore_front(&self, job: JobRecord) {
        self.jobs.lock().await.push_front(job);
    }

    pub async fn clear(&self) -> Result<usize> {
        let mut jobs = self.jobs.lock().await;
        if let Some(journal) = &self.journal {
            journal
                .append(&Op::ClearQueue {
                    queue: self.name.clone(),
                })
                .await?;
        }
        let n = jobs.len();
        jobs.clear();
        Ok(n)
    }

    pub async fn size(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Up to `n` jobs from the head, without removing them.
    pub async fn peek(&self, n: usize) -> Vec<JobRecord> {
        self.jobs.lock().await.iter().take(n).cloned().collect()
    }

    pub async fn contains(&self, jid: &str) -> bool {
        self.jobs.lock().await.iter().any(|j| j.jid == jid)
    }
}
