use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{BrokerError, Result};
use crate::job::{Jid, JobRecord, after, now};
use crate::journal::{Journal, Op, Source};

const SCAN_BATCH: usize = 256;

/// A job currently reserved by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub job: JobRecord,
    pub queue: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn jid(&self) -> &str {
        &self.job.jid
    }
}

#[derive(Debug, Default)]
pub(crate) struct WorkingState {
    leases: HashMap<Jid, Lease>,
    expiry: BTreeSet<(DateTime<Utc>, Jid)>,
}

impl WorkingState {
    /// Returns the lease back if the jid is already leased.
    pub(crate) fn insert(&mut self, lease: Lease) -> std::result::Result<(), Lease> {
        if self.leases.contains_key(&lease.job.jid) {
            return Err(lease);
        }
        self.expiry
            .insert((lease.expires_at, lease.job.jid.clone()));
        self.leases.insert(lease.job.jid.clone(), lease);
        Ok(())
    }

    pub(crate) fn remove(&mut self, jid: &str) -> Option<Lease> {
        let lease = self.leases.remove(jid)?;
        self.expiry.remove(&(lease.expires_at, lease.job.jid.clone()));
        Some(lease)
    }

    pub(crate) fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    fn expired_after(
        &self,
        cursor: Option<&(DateTime<Utc>, Jid)>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<(DateTime<Utc>, Jid)> {
        let lower = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Unbounded,
        };
        self.expiry
            .range((lower, Bound::Unbounded))
            .take_while(|(at, _)| *at <= now)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Jobs leased to workers, keyed by jid, each with an expiry deadline.
pub struct WorkingSet {
    state: Mutex<WorkingState>,
    journal: Option<Arc<Journal>>,
}

impl WorkingSet {
    pub(crate) fn from_state(state: WorkingState, journal: Option<Arc<Journal>>) -> Self {
        Self {
            state: Mutex::new(state),
            journal,
        }
    }

    /// Record a new in-flight job expiring `ttl` from now.
    pub async fn lease(&self, job: JobRecord, queue: &str, ttl: Duration) -> Result<Lease> {
        self.insert(job, queue, ttl, None).await
    }

    pub(crate) async fn insert(
        &self,
        job: JobRecord,
        queue: &str,
        ttl: Duration,
        from: Option<Source>,
    ) -> Result<Lease> {
        let lease = Lease {
            expires_at: after(now(), ttl),
            queue: queue.to_string(),
            job,
        };

        let mut state = self.state.lock().await;
        if state.leases.contains_key(lease.jid()) {
            tracing::warn!(jid = %lease.jid(), queue = %queue, "job already has a live lease");
            return Err(BrokerError::Conflict(format!(
                "job {} is already leased",
                lease.jid()
            )));
        }
        if let Some(journal) = &self.journal {
            journal
                .append(&Op::Lease {
                    lease: lease.clone(),
                    from,
                })
                .await?;
        }
        // presence was checked under the same lock
        let _ = state.insert(lease.clone());
        tracing::debug!(jid = %lease.jid(), queue = %queue, expires_at = %lease.expires_at, "leased");
        Ok(lease)
    }

    /// Remove a lease for good (ack). `Ok(None)` if it was already reaped.
    pub async fn release(&self, jid: &str) -> Result<Option<Lease>> {
        let mut state = self.state.lock().await;
        if !state.leases.contains_key(jid) {
            return Ok(None);
        }
        if let Some(journal) = &self.journal {
            journal
                .append(&Op::Remove {
                    from: Source::Working {
                        jid: jid.to_string(),
                    },
                })
                .await?;
        }
        Ok(state.remove(jid))
    }

    /// Detach a lease for a move; the destination journals the move.
    pub(crate) async fn take(&self, jid: &str) -> Option<Lease> {
        self.state.lock().await.remove(jid)
    }

    /// Like `take`, but only if the lease is still expired at `now`.
    pub(crate) async fn take_expired(&self, jid: &str, now: DateTime<Utc>) -> Option<Lease> {
        let mut state = self.state.lock().await;
        let expired = state
            .leases
            .get(jid)
            .is_some_and(|lease| lease.expires_at <= now);
        if expired { state.remove(jid) } else { None }
    }

    pub(crate) async fn restore(&self, lease: Lease) {
        let _ = self.state.lock().await.insert(lease);
    }

    /// Lazy walk over leases whose expiry is at or before `now`.
    pub fn scan_expired(&self, now: DateTime<Utc>) -> ExpiredScan<'_> {
        ExpiredScan {
            set: self,
            now,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn get(&self, jid: &str) -> Option<Lease> {
        self.state.lock().await.leases.get(jid).cloned()
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.leases.len()
    }

    /// All leases, soonest expiry first.
    pub async fn list(&self) -> Vec<Lease> {
        let state = self.state.lock().await;
        state
            .expiry
            .iter()
            .filter_map(|(_, jid)| state.leases.get(jid).cloned())
            .collect()
    }
}

pub struct ExpiredScan<'a> {
    set: &'a WorkingSet,
    now: DateTime<Utc>,
    cursor: Option<(DateTime<Utc>, Jid)>,
    buffer: VecDeque<Lease>,
    exhausted: bool,
}

impl ExpiredScan<'_> {
    pub async fn next(&mut self) -> Option<Lease> {
        if self.buffer.is_empty() && !self.exhausted {
            let set = self.set;
            let state = set.state.lock().await;
            let batch = state.expired_after(self.cursor.as_ref(), self.now, SCAN_BATCH);
            self.exhausted = batch.len() < SCAN_BATCH;
            self.cursor = batch.last().cloned();
            self.buffer.extend(
                batch
                    .iter()
                    .filter_map(|(_, jid)| state.leases.get(jid).cloned()),
            );
        }
        self.buffer.pop_front()
    }

    pub async fn collect(mut self) -> Vec<Lease> {
        let mut out = Vec::new();
        while let Some(lease) = self.next().await {
            out.push(lease);
        }
        out
    }
}
