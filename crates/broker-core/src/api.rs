use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::job::{Jid, JobRecord};
use crate::retry::{Disposition, FailInfo};
use crate::sorted::{SetEntry, SetKey, SetKind};
use crate::store::Stats;
use crate::working::Lease;

/// Where a pushed job landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "to")]
pub enum Pushed {
    Queued { queue: String },
    Scheduled { key: String },
}

/// Operations the protocol and monitoring layers call.
#[async_trait]
pub trait JobBroker: Send + Sync {
    async fn push(&self, job: JobRecord) -> Result<Pushed>;

    /// Lease the head of the first non-empty queue in `queues`.
    /// `Ok(None)` when every queue is empty.
    async fn fetch(&self, queues: &[String], ttl: Option<Duration>) -> Result<Option<JobRecord>>;

    async fn ack(&self, jid: &str) -> Result<()>;

    async fn fail(&self, jid: &str, info: FailInfo) -> Result<Disposition>;

    async fn stats(&self) -> Stats;

    /// Jobs currently leased, soonest expiry first.
    async fn working(&self) -> Vec<Lease>;

    async fn queue_jobs(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>>;

    async fn set_entries(&self, set: SetKind, offset: usize, limit: usize) -> Vec<SetEntry>;

    async fn set_entry(&self, set: SetKind, key: &SetKey) -> Result<JobRecord>;

    /// Move one set entry into its queue right away.
    async fn retry_now(&self, set: SetKind, key: &SetKey) -> Result<String>;

    async fn delete(&self, set: SetKind, key: &SetKey) -> Result<JobRecord>;

    /// Give up on a retry entry: move it to the dead set.
    async fn kill(&self, key: &SetKey) -> Result<Jid>;
}
