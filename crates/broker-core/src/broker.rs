use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{JobBroker, Pushed};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::job::{Jid, JobRecord, now};
use crate::journal::Source;
use crate::reaper::Reaper;
use crate::retry::{Disposition, FailInfo, RetryPolicy};
use crate::sorted::{SetEntry, SetKey, SetKind};
use crate::store::{Stats, Store};
use crate::working::Lease;

/// Push/fetch/ack/fail orchestration over a shared [`Store`].
#[derive(Clone)]
pub struct Broker {
    store: Arc<Store>,
    config: BrokerConfig,
    policy: RetryPolicy,
}

impl Broker {
    pub fn new(store: Arc<Store>, config: BrokerConfig) -> Self {
        let policy = config.retry_policy();
        Self {
            store,
            config,
            policy,
        }
    }

    /// An in-memory broker, mostly for tests.
    pub fn in_memory(config: BrokerConfig) -> Self {
        let store = Arc::new(Store::in_memory(&config.store_options()));
        Self::new(store, config)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.store.clone(),
            self.policy.clone(),
            self.config.reaper_interval,
        )
    }

    /// Validate and route a raw payload.
    pub async fn push_bytes(&self, payload: &[u8]) -> Result<Pushed> {
        self.push_job(JobRecord::parse(payload)?).await
    }

    /// Future-dated jobs wait in Scheduled; everything else goes straight to its queue.
    pub async fn push_job(&self, job: JobRecord) -> Result<Pushed> {
        let mut job = job.validated()?;
        let now = now();
        job.created_at.get_or_insert(now);

        if let Some(at) = job.scheduled_for(now) {
            let key = self.store.scheduled().add(at, job).await?;
            tracing::debug!(key = %key, "scheduled");
            return Ok(Pushed::Scheduled {
                key: key.to_string(),
            });
        }

        let queue = self.store.get_queue(&job.queue).await?;
        let jid = job.jid.clone();
        queue.push_job(job).await?;
        tracing::debug!(jid = %jid, queue = %queue.name(), "pushed");
        Ok(Pushed::Queued {
            queue: queue.name().to_string(),
        })
    }

    /// Pop the head of `queue` and lease it for `ttl` (or the job's `reserve_for`).
    pub async fn fetch_one(&self, queue: &str, ttl: Duration) -> Result<Option<JobRecord>> {
        let queue = self.store.get_queue(queue).await?;
        let Some(job) = queue.take().await else {
            return Ok(None);
        };

        let from = Source::Queue {
            queue: queue.name().to_string(),
            jid: job.jid.clone(),
        };
        let ttl = job.lease_ttl(ttl);
        match self
            .store
            .working()
            .insert(job.clone(), queue.name(), ttl, Some(from))
            .await
        {
            Ok(_) => Ok(Some(job)),
            Err(e) => {
                queue.restore_front(job).await;
                Err(e)
            }
        }
    }

    /// Try `queues` in order; lease from the first one that has work.
    pub async fn fetch_any<S: AsRef<str>>(
        &self,
        queues: &[S],
        ttl: Duration,
    ) -> Result<Option<JobRecord>> {
        if queues.is_empty() {
            return Err(BrokerError::Validation("at least one queue is required".into()));
        }
        for queue in queues {
            if let Some(job) = self.fetch_one(queue.as_ref(), ttl).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Finish a job. NotFound if the lease is gone (acked already or reaped).
    pub async fn ack_job(&self, jid: &str) -> Result<()> {
        match self.store.working().release(jid).await? {
            Some(_) => {
                tracing::debug!(jid = %jid, "acked");
                Ok(())
            }
            None => Err(BrokerError::NotFound(format!("no live lease for {jid}"))),
        }
    }

    /// Record a worker-reported failure without waiting for the lease to expire.
    pub async fn fail_job(&self, jid: &str, info: FailInfo) -> Result<Disposition> {
        let Some(lease) = self.store.working().take(jid).await else {
            return Err(BrokerError::NotFound(format!("no live lease for {jid}")));
        };
        self.store.reschedule(lease, info, &self.policy, now()).await
    }
}

#[async_trait]
impl JobBroker for Broker {
    async fn push(&self, job: JobRecord) -> Result<Pushed> {
        self.push_job(job).await
    }

    async fn fetch(&self, queues: &[String], ttl: Option<Duration>) -> Result<Option<JobRecord>> {
        self.fetch_any(queues, ttl.unwrap_or(self.config.default_lease))
            .await
    }

    async fn ack(&self, jid: &str) -> Result<()> {
        self.ack_job(jid).await
    }

    async fn fail(&self, jid: &str, info: FailInfo) -> Result<Disposition> {
        self.fail_job(jid, info).await
    }

    async fn stats(&self) -> Stats {
        self.store.stats().await
    }

    async fn working(&self) -> Vec<Lease> {
        self.store.working().list().await
    }

    async fn queue_jobs(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>> {
        match self.store.existing_queue(queue).await {
            Some(q) => Ok(q.peek(limit).await),
            None => Err(BrokerError::NotFound(format!("no queue named {queue}"))),
        }
    }

    async fn set_entries(&self, set: SetKind, offset: usize, limit: usize) -> Vec<SetEntry> {
        self.store.set(set).page(offset, limit).await
    }

    async fn set_entry(&self, set: SetKind, key: &SetKey) -> Result<JobRecord> {
        self.store
            .set(set)
            .get(key)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("no {set} entry {key}")))
    }

    async fn retry_now(&self, set: SetKind, key: &SetKey) -> Result<String> {
        self.store
            .promote(set, key)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("no {set} entry {key}")))
    }

    async fn delete(&self, set: SetKind, key: &SetKey) -> Result<JobRecord> {
        self.store
            .set(set)
            .remove(key)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("no {set} entry {key}")))
    }

    async fn kill(&self, key: &SetKey) -> Result<Jid> {
        let job = self
            .store
            .transfer(SetKind::Retries, key, SetKind::Dead, now())
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("no retries entry {key}")))?;
        Ok(job.jid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Location;
    use chrono::TimeDelta;

    fn broker() -> Broker {
        Broker::in_memory(BrokerConfig::default())
    }

    fn job(jid: &str) -> JobRecord {
        JobRecord::new(jid, "SomeWorker", "default")
    }

    #[tokio::test]
    async fn future_jobs_are_scheduled_past_ones_queued() {
        let b = broker();

        let mut later = job("later");
        later.at = Some(now() + TimeDelta::minutes(5));
        assert!(matches!(b.push(later).await.unwrap(), Pushed::Scheduled { .. }));

        let mut overdue = job("overdue");
        overdue.at = Some(now() - TimeDelta::minutes(5));
        assert_eq!(
            b.push(overdue).await.unwrap(),
            Pushed::Queued {
                queue: "default".into()
            }
        );

        assert_eq!(b.store().locate("later").await, vec![Location::Scheduled]);
        assert_eq!(
            b.store().locate("overdue").await,
            vec![Location::Queue("default".into())]
        );
    }

    #[tokio::test]
    async fn fetch_on_empty_queue_is_not_an_error() {
        let b = broker();
        assert!(b.fetch_one("nothing-here", Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_any_respects_queue_order() {
        let b = broker();
        let mut low = job("low");
        low.queue = "low".into();
        let mut high = job("high");
        high.queue = "high".into();
        b.push(low).await.unwrap();
        b.push(high).await.unwrap();

        let order = ["high", "low"];
        let first = b.fetch_any(&order, Duration::from_secs(30)).await.unwrap().unwrap();
        let second = b.fetch_any(&order, Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!((first.jid.as_str(), second.jid.as_str()), ("high", "low"));
    }

    #[tokio::test]
    async fn conflicting_lease_leaves_queue_unchanged() {
        let b = broker();
        b.push(job("dup")).await.unwrap();
        b.fetch_one("default", Duration::from_secs(30)).await.unwrap().unwrap();

        // a producer reused the jid while the first copy is still leased
        b.push(job("dup")).await.unwrap();
        let err = b.fetch_one("default", Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));
        assert_eq!(b.store().get_queue("default").await.unwrap().size().await, 1);
    }

    #[tokio::test]
    async fn fail_retries_immediately() {
        let b = broker();
        b.push(job("j1")).await.unwrap();
        b.fetch_one("default", Duration::from_secs(30)).await.unwrap().unwrap();

        let disposition = b.fail_job("j1", FailInfo::new("RuntimeError", "boom")).await.unwrap();
        assert!(matches!(disposition, Disposition::Retry { .. }));
        let entry = b.store().retries().find("j1").await.unwrap();
        assert_eq!(entry.job.failure.unwrap().message.as_deref(), Some("boom"));

        assert!(b.fail_job("j1", FailInfo::default()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn working_lists_soonest_expiry_first() {
        let b = broker();
        b.push(job("long")).await.unwrap();
        b.push(job("short")).await.unwrap();
        b.fetch_one("default", Duration::from_secs(600)).await.unwrap();
        b.fetch_one("default", Duration::from_secs(5)).await.unwrap();

        let jids: Vec<_> = b.working().await.iter().map(|l| l.jid().to_string()).collect();
        assert_eq!(jids, vec!["short", "long"]);
    }

    async fn durable(dir: &std::path::Path) -> Broker {
        let config = BrokerConfig::default();
        let store = Store::open(dir, &config.store_options()).await.unwrap();
        Broker::new(Arc::new(store), config)
    }

    #[tokio::test]
    async fn failed_lease_write_puts_job_back_at_the_head() {
        let dir = tempfile::tempdir().unwrap();
        let b = durable(dir.path()).await;
        b.push(job("j1")).await.unwrap();
        b.push(job("j2")).await.unwrap();

        b.store().fail_next_write(3).await;
        let err = b.fetch_one("default", Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Storage(_)));
        assert_eq!(b.store().working().size().await, 0);
        let head = b.store().get_queue("default").await.unwrap().peek(1).await;
        assert_eq!(head[0].jid, "j1");

        let fetched = b.fetch_one("default", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(fetched.jid, "j1");
    }

    #[tokio::test]
    async fn failed_failure_write_keeps_the_lease() {
        let dir = tempfile::tempdir().unwrap();
        let b = durable(dir.path()).await;
        b.push(job("j1")).await.unwrap();
        b.fetch_one("default", Duration::from_secs(30)).await.unwrap().unwrap();

        b.store().fail_next_write(0).await;
        assert!(b.fail_job("j1", FailInfo::default()).await.is_err());
        assert_eq!(b.store().locate("j1").await, vec![Location::Working]);
        b.ack_job("j1").await.unwrap();
    }

    #[tokio::test]
    async fn failed_kill_leaves_the_retry_entry() {
        let dir = tempfile::tempdir().unwrap();
        let b = durable(dir.path()).await;
        let key = b.store().retries().add(now(), job("r1")).await.unwrap();

        b.store().fail_next_write(10).await;
        assert!(b.kill(&key).await.is_err());
        assert_eq!(b.store().locate("r1").await, vec![Location::Retries]);

        assert_eq!(b.kill(&key).await.unwrap(), "r1");
        drop(b);
        let reopened = durable(dir.path()).await;
        assert_eq!(reopened.store().locate("r1").await, vec![Location::Dead]);
    }

    #[tokio::test]
    async fn admin_actions_on_set_entries() {
        let b = broker();
        let key = b.store().retries().add(now(), job("r1")).await.unwrap();
        let jid = b.kill(&key).await.unwrap();
        assert_eq!(jid, "r1");
        assert_eq!(b.store().locate("r1").await, vec![Location::Dead]);
        assert!(b.kill(&key).await.unwrap_err().is_not_found());

        let dead_key = b.store().dead().find("r1").await.unwrap().key;
        assert_eq!(b.retry_now(SetKind::Dead, &dead_key).await.unwrap(), "default");
        assert_eq!(
            b.store().locate("r1").await,
            vec![Location::Queue("default".into())]
        );

        let key = b.store().scheduled().add(now(), job("s1")).await.unwrap();
        assert_eq!(b.delete(SetKind::Scheduled, &key).await.unwrap().jid, "s1");
        assert!(b.store().locate("s1").await.is_empty());
        assert!(b.set_entry(SetKind::Scheduled, &key).await.unwrap_err().is_not_found());
    }
}
