use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{BrokerError, Result};
use crate::job::JobRecord;
use crate::journal::{CompactionPolicy, Journal, Op, Recovered, Source};
use crate::queue::FifoQueue;
use crate::retry::{Disposition, FailInfo, RetryPolicy};
use crate::sorted::{SetKey, SetKind, TimeIndexedSet};
use crate::working::{Lease, WorkingSet};

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Maximum dead-set size; 0 disables the bound.
    pub dead_capacity: usize,
    /// fsync every journal record, not just hand it to the OS.
    pub sync_writes: bool,
    pub compaction: CompactionPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            dead_capacity: 10_000,
            sync_writes: false,
            compaction: CompactionPolicy::default(),
        }
    }
}

/// Where a job currently lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "in", content = "name")]
pub enum Location {
    Queue(String),
    Scheduled,
    Retries,
    Dead,
    Working,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub queues: BTreeMap<String, usize>,
    pub scheduled: usize,
    pub retries: usize,
    pub dead: usize,
    pub working: usize,
}

/// Owner of every queue, the three time-indexed sets and the working set.
///
/// Each structure carries its own lock; the store itself only guards the
/// queue-name map.
pub struct Store {
    queues: RwLock<HashMap<String, Arc<FifoQueue>>>,
    scheduled: TimeIndexedSet,
    retries: TimeIndexedSet,
    dead: TimeIndexedSet,
    working: WorkingSet,
    journal: Option<Arc<Journal>>,
    opts: StoreOptions,
}

impl Store {
    /// A store that lives only as long as the process.
    pub fn in_memory(opts: &StoreOptions) -> Self {
        Self::assemble(Recovered::new(Some(opts.dead_capacity)), None, opts)
    }

    /// Open (or create) a journal-backed store in `dir`, replaying and
    /// compacting whatever an earlier process left behind.
    pub async fn open(dir: impl AsRef<Path>, opts: &StoreOptions) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let ops = Journal::read(dir).await?;
        let replayed = ops.len();
        let mut recovered = Recovered::new(Some(opts.dead_capacity));
        for op in ops {
            recovered.apply(op);
        }

        let snapshot = recovered.snapshot();
        let journal = Arc::new(Journal::rewrite(dir, &snapshot, opts.sync_writes).await?);
        tracing::info!(
            path = %journal.path().display(),
            replayed,
            compacted = snapshot.len(),
            "store opened"
        );
        Ok(Self::assemble(recovered, Some(journal), opts))
    }

    fn assemble(recovered: Recovered, journal: Option<Arc<Journal>>, opts: &StoreOptions) -> Self {
        let queues = recovered
            .queues
            .into_iter()
            .map(|(name, jobs)| {
                let queue = Arc::new(FifoQueue::new(name.clone(), jobs, journal.clone()));
                (name, queue)
            })
            .collect();
        Self {
            queues: RwLock::new(queues),
            scheduled: TimeIndexedSet::from_state(
                SetKind::Scheduled,
                recovered.scheduled,
                journal.clone(),
            ),
            retries: TimeIndexedSet::from_state(SetKind::Retries, recovered.retries, journal.clone()),
            dead: TimeIndexedSet::from_state(SetKind::Dead, recovered.dead, journal.clone()),
            working: WorkingSet::from_state(recovered.working, journal.clone()),
            journal,
            opts: opts.clone(),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }

    /// Rewrite the journal down to the current state. `Ok(None)` for an
    /// in-memory store or when the attempt raced a failed append.
    pub async fn compact(&self) -> Result<Option<usize>> {
        match &self.journal {
            Some(journal) => journal.compact(Some(self.opts.dead_capacity)).await,
            None => Ok(None),
        }
    }

    /// [`Store::compact`], but only once the journal has grown enough to be
    /// worth it.
    pub async fn compact_if_due(&self) -> Result<Option<usize>> {
        match &self.journal {
            Some(journal) if journal.compaction_due(&self.opts.compaction).await => {
                self.compact().await
            }
            _ => Ok(None),
        }
    }

    /// Make the next journal append write `written` bytes and then fail.
    #[cfg(test)]
    pub(crate) async fn fail_next_write(&self, written: usize) {
        if let Some(journal) = &self.journal {
            journal.fail_next_append(written).await;
        }
    }

    /// The queue called `name`, created empty on first reference.
    pub async fn get_queue(&self, name: &str) -> Result<Arc<FifoQueue>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BrokerError::Validation("queue name is required".into()));
        }
        if let Some(queue) = self.queues.read().await.get(name) {
            return Ok(queue.clone());
        }

        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }
        if let Some(journal) = &self.journal {
            journal
                .append(&Op::Declare {
                    queue: name.to_string(),
                })
                .await?;
        }
        tracing::debug!(queue = %name, "queue created");
        let queue = Arc::new(FifoQueue::new(name, VecDeque::new(), self.journal.clone()));
        queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Look up a queue without creating it.
    pub async fn existing_queue(&self, name: &str) -> Option<Arc<FifoQueue>> {
        self.queues.read().await.get(name.trim()).cloned()
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn scheduled(&self) -> &TimeIndexedSet {
        &self.scheduled
    }

    pub fn retries(&self) -> &TimeIndexedSet {
        &self.retries
    }

    pub fn dead(&self) -> &TimeIndexedSet {
        &self.dead
    }

    pub fn set(&self, kind: SetKind) -> &TimeIndexedSet {
        match kind {
            SetKind::Scheduled => &self.scheduled,
            SetKind::Retries => &self.retries,
            SetKind::Dead => &self.dead,
        }
    }

    pub fn working(&self) -> &WorkingSet {
        &self.working
    }

    /// Every structure currently holding `jid`. Healthy state has exactly one.
    pub async fn locate(&self, jid: &str) -> Vec<Location> {
        let mut found = Vec::new();
        let queues: Vec<Arc<FifoQueue>> = self.queues.read().await.values().cloned().collect();
        for queue in queues {
            if queue.contains(jid).await {
                found.push(Location::Queue(queue.name().to_string()));
            }
        }
        if self.scheduled.find(jid).await.is_some() {
            found.push(Location::Scheduled);
        }
        if self.retries.find(jid).await.is_some() {
            found.push(Location::Retries);
        }
        if self.dead.find(jid).await.is_some() {
            found.push(Location::Dead);
        }
        if self.working.get(jid).await.is_some() {
            found.push(Location::Working);
        }
        found
    }

    pub async fn stats(&self) -> Stats {
        let queues: Vec<Arc<FifoQueue>> = self.queues.read().await.values().cloned().collect();
        let mut sizes = BTreeMap::new();
        for queue in queues {
            sizes.insert(queue.name().to_string(), queue.size().await);
        }
        Stats {
            queues: sizes,
            scheduled: self.scheduled.size().await,
            retries: self.retries.size().await,
            dead: self.dead.size().await,
            working: self.working.size().await,
        }
    }
}

// Cross-structure moves. The job is detached from its source under the
// source's lock, then inserted (and journaled as one move record) under the
// destination's lock; no two structure locks are ever held together. If the
// destination write fails the job goes back where it came from.
impl Store {
    /// Move a set entry into its job's queue.
    pub(crate) async fn promote(&self, kind: SetKind, key: &SetKey) -> Result<Option<String>> {
        let set = self.set(kind);
        let Some(job) = set.take(key).await else {
            return Ok(None);
        };
        let queue_name = job.queue.clone();
        let from = Source::Set {
            set: kind,
            key: key.clone(),
        };

        let moved = match self.get_queue(&queue_name).await {
            Ok(queue) => queue.insert(job.clone(), Some(from)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = moved {
            set.restore(key.clone(), job).await;
            return Err(e);
        }
        tracing::debug!(set = %kind, jid = %key.jid, queue = %queue_name, "promoted");
        Ok(Some(queue_name))
    }

    /// Record a failure on a detached lease and file it under Retry or Dead.
    pub(crate) async fn reschedule(
        &self,
        lease: Lease,
        info: FailInfo,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Disposition> {
        let mut job = lease.job.clone();
        let disposition = policy.record_failure(&mut job, info, now);
        let from = Source::Working {
            jid: job.jid.clone(),
        };

        let moved = match disposition {
            Disposition::Retry { at } => self.retries.insert(at, job, Some(from)).await,
            Disposition::Dead => self.dead.insert(now, job, Some(from)).await,
        };
        if let Err(e) = moved {
            self.working.restore(lease).await;
            return Err(e);
        }
        tracing::debug!(jid = %lease.job.jid, ?disposition, "failure recorded");
        Ok(disposition)
    }

    /// Move a set entry into another set at `at`.
    pub(crate) async fn transfer(
        &self,
        from_kind: SetKind,
        key: &SetKey,
        to_kind: SetKind,
        at: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let source = self.set(from_kind);
        let Some(job) = source.take(key).await else {
            return Ok(None);
        };
        let from = Source::Set {
            set: from_kind,
            key: key.clone(),
        };
        if let Err(e) = self.set(to_kind).insert(at, job.clone(), Some(from)).await {
            source.restore(key.clone(), job).await;
            return Err(e);
        }
        Ok(Some(job))
    }
}
