//! Periodic background pass that promotes due scheduled/retry entries into
//! their queues and reclaims expired leases.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::job::now;
use crate::retry::{Disposition, FailInfo, RetryPolicy};
use crate::sorted::SetKind;
use crate::store::Store;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Scheduled jobs moved into their queue.
    pub scheduled: usize,
    /// Retry entries moved into their queue.
    pub retries: usize,
    /// Expired leases filed under Retry.
    pub reclaimed: usize,
    /// Expired leases that exhausted their retries.
    pub dead: usize,
    /// Moves that failed and will be tried again next tick.
    pub errors: usize,
    /// The journal was rewritten down to the live state.
    pub compacted: bool,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        *self == TickReport::default()
    }
}

pub struct Reaper {
    store: Arc<Store>,
    policy: RetryPolicy,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<Store>, policy: RetryPolicy, interval: Duration) -> Self {
        Self {
            store,
            policy,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(now()).await
    }

    /// One full pass as of `now`. Individual failures are logged and counted,
    /// never propagated.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        report.scheduled = self.promote_due(SetKind::Scheduled, now, &mut report.errors).await;
        report.retries = self.promote_due(SetKind::Retries, now, &mut report.errors).await;
        self.reclaim_expired(now, &mut report).await;
        match self.store.compact_if_due().await {
            Ok(done) => report.compacted = done.is_some(),
            Err(e) => {
                report.errors += 1;
                tracing::warn!(error = %e, "journal compaction failed");
            }
        }
        report
    }

    async fn promote_due(&self, kind: SetKind, now: DateTime<Utc>, errors: &mut usize) -> usize {
        let mut promoted = 0;
        let mut scan = self.store.set(kind).scan_due(now);
        while let Some(entry) = scan.next().await {
            match self.store.promote(kind, &entry.key).await {
                Ok(Some(_)) => promoted += 1,
                // acked, deleted or promoted by someone else meanwhile
                Ok(None) => {}
                Err(e) => {
                    *errors += 1;
                    tracing::warn!(set = %kind, key = %entry.key, error = %e, "promotion failed");
                }
            }
        }
        promoted
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let working = self.store.working();
        let mut scan = working.scan_expired(now);
        while let Some(expired) = scan.next().await {
            let Some(lease) = working.take_expired(expired.jid(), now).await else {
                continue;
            };
            let jid = lease.job.jid.clone();
            match self
                .store
                .reschedule(lease, FailInfo::lease_expired(), &self.policy, now)
                .await
            {
                Ok(Disposition::Retry { .. }) => report.reclaimed += 1,
                Ok(Disposition::Dead) => report.dead += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(jid = %jid, error = %e, "lease reclaim failed");
                }
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        self.spawn_with(cancel, |_| {})
    }

    /// Run the loop on the runtime, calling `on_tick` after every pass.
    pub fn spawn_with<F>(self, cancel: CancellationToken, on_tick: F) -> JoinHandle<()>
    where
        F: Fn(&TickReport) + Send + 'static,
    {
        tokio::spawn(self.run(cancel, on_tick))
    }

    /// Loop until `cancel` fires. A tick in progress always runs to completion.
    pub async fn run<F>(self, cancel: CancellationToken, on_tick: F)
    where
        F: Fn(&TickReport) + Send + 'static,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "reaper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.errors > 0 {
                        tracing::error!(?report, "reaper tick had failures; retrying next tick");
                    } else if !report.is_empty() {
                        tracing::info!(?report, "reaper tick");
                    }
                    on_tick(&report);
                }
            }
        }
        tracing::info!("reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRecord;
    use crate::retry::Backoff;
    use crate::store::{Location, StoreOptions};
    use chrono::TimeDelta;

    fn reaper(store: &Arc<Store>, max_retries: u32) -> Reaper {
        Reaper::new(
            store.clone(),
            RetryPolicy {
                max_retries,
                backoff: Backoff::Fixed(Duration::from_secs(60)),
            },
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn promotes_only_due_entries() {
        let store = Arc::new(Store::in_memory(&StoreOptions::default()));
        let t = now();
        store
            .scheduled()
            .add(t - TimeDelta::seconds(1), JobRecord::new("due", "W", "mail"))
            .await
            .unwrap();
        store
            .scheduled()
            .add(t + TimeDelta::hours(1), JobRecord::new("later", "W", "mail"))
            .await
            .unwrap();

        let report = reaper(&store, 25).tick_at(t).await;
        assert_eq!(report.scheduled, 1);
        assert_eq!(store.locate("due").await, vec![Location::Queue("mail".into())]);
        assert_eq!(store.locate("later").await, vec![Location::Scheduled]);
    }

    #[tokio::test]
    async fn expired_leases_go_to_retry_then_dead() {
        let store = Arc::new(Store::in_memory(&StoreOptions::default()));
        let r = reaper(&store, 2);

        store
            .working()
            .lease(JobRecord::new("j1", "W", "default"), "default", Duration::ZERO)
            .await
            .unwrap();
        let report = r.tick().await;
        assert_eq!(report.reclaimed, 1);
        let entry = store.retries().find("j1").await.unwrap();
        assert_eq!(entry.job.retry_count(), 1);
        assert_eq!(
            entry.job.failure.as_ref().unwrap().errtype.as_deref(),
            Some("LeaseExpired")
        );

        // second expiry exhausts the two allowed attempts
        let job = store.retries().remove(&entry.key).await.unwrap().unwrap();
        store
            .working()
            .lease(job, "default", Duration::ZERO)
            .await
            .unwrap();
        let report = r.tick().await;
        assert_eq!(report.dead, 1);
        assert_eq!(store.locate("j1").await, vec![Location::Dead]);
    }

    #[tokio::test]
    async fn live_leases_are_left_alone() {
        let store = Arc::new(Store::in_memory(&StoreOptions::default()));
        store
            .working()
            .lease(JobRecord::new("j1", "W", "default"), "default", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(reaper(&store, 25).tick().await.is_empty());
        assert_eq!(store.locate("j1").await, vec![Location::Working]);
    }

    async fn durable(dir: &std::path::Path, opts: &StoreOptions) -> Arc<Store> {
        Arc::new(Store::open(dir, opts).await.unwrap())
    }

    #[tokio::test]
    async fn failed_promotion_stays_put_until_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let store = durable(dir.path(), &StoreOptions::default()).await;
        store.get_queue("mail").await.unwrap();
        store
            .scheduled()
            .add(now() - TimeDelta::seconds(1), JobRecord::new("s1", "W", "mail"))
            .await
            .unwrap();
        let r = reaper(&store, 25);

        store.fail_next_write(7).await;
        let report = r.tick().await;
        assert_eq!((report.scheduled, report.errors), (0, 1));
        assert_eq!(store.locate("s1").await, vec![Location::Scheduled]);

        let report = r.tick().await;
        assert_eq!((report.scheduled, report.errors), (1, 0));
        assert_eq!(store.locate("s1").await, vec![Location::Queue("mail".into())]);

        drop(store);
        let reopened = durable(dir.path(), &StoreOptions::default()).await;
        assert_eq!(reopened.locate("s1").await, vec![Location::Queue("mail".into())]);
    }

    #[tokio::test]
    async fn failed_reclaim_keeps_the_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = durable(dir.path(), &StoreOptions::default()).await;
        store
            .working()
            .lease(JobRecord::new("j1", "W", "default"), "default", Duration::ZERO)
            .await
            .unwrap();
        let r = reaper(&store, 25);

        store.fail_next_write(0).await;
        let report = r.tick().await;
        assert_eq!((report.reclaimed, report.errors), (0, 1));
        assert_eq!(store.locate("j1").await, vec![Location::Working]);

        let report = r.tick().await;
        assert_eq!((report.reclaimed, report.errors), (1, 0));
        assert_eq!(store.locate("j1").await, vec![Location::Retries]);
    }

    #[tokio::test]
    async fn tick_compacts_a_grown_journal() {
        let dir = tempfile::tempdir().unwrap();
        let opts = StoreOptions {
            compaction: crate::journal::CompactionPolicy {
                min_records: 20,
                ratio: 2,
            },
            ..StoreOptions::default()
        };
        let store = durable(dir.path(), &opts).await;
        let q = store.get_queue("default").await.unwrap();
        for i in 0..30 {
            q.push_job(JobRecord::new(format!("j{i}"), "W", "default")).await.unwrap();
            q.pop().await.unwrap();
        }
        q.push_job(JobRecord::new("keep", "W", "default")).await.unwrap();

        let report = reaper(&store, 25).tick().await;
        assert!(report.compacted);
        let journal = std::fs::read_to_string(dir.path().join(crate::journal::JOURNAL_FILE)).unwrap();
        assert_eq!(journal.lines().count(), 2);

        drop(store);
        let reopened = durable(dir.path(), &opts).await;
        assert_eq!(reopened.locate("keep").await, vec![Location::Queue("default".into())]);
        assert_eq!(reopened.stats().await.queues["default"], 1);
    }

    #[tokio::test]
    async fn loop_stops_on_cancel() {
        let store = Arc::new(Store::in_memory(&StoreOptions::default()));
        store
            .scheduled()
            .add(now(), JobRecord::new("j1", "W", "default"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = Reaper::new(store.clone(), RetryPolicy::default(), MIN_INTERVAL).spawn_with(
            cancel.clone(),
            move |report| {
                let _ = tx.send(*report);
            },
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.scheduled, 1);
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.locate("j1").await, vec![Location::Queue("default".into())]);
    }
}
