use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use broker_core::job::now;
use broker_core::{
    Broker, BrokerConfig, BrokerError, Disposition, FailInfo, JobBroker, JobRecord, Location,
    Pushed, SetKey, SetKind,
};
use chrono::TimeDelta;
use serde_json::json;

fn broker_with(max_retries: u32, dead_capacity: usize) -> Broker {
    Broker::in_memory(BrokerConfig {
        max_retries,
        dead_capacity,
        ..BrokerConfig::default()
    })
}

fn job(jid: &str, queue: &str) -> JobRecord {
    let mut job = JobRecord::new(jid, "SomeWorker", queue);
    job.args = Some(json!([jid]));
    job
}

async fn assert_single_home(broker: &Broker, jid: &str) -> Location {
    let found = broker.store().locate(jid).await;
    assert_eq!(found.len(), 1, "{jid} found in {found:?}");
    found.into_iter().next().unwrap()
}

#[tokio::test]
async fn end_to_end_push_fetch_ack() {
    let broker = broker_with(25, 100);
    broker.push(job("j1", "default")).await.unwrap();

    let fetched = broker
        .fetch_one("default", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.jid, "j1");
    assert_eq!(assert_single_home(&broker, "j1").await, Location::Working);

    broker.ack_job("j1").await.unwrap();
    assert!(broker.store().locate("j1").await.is_empty());
}

#[tokio::test]
async fn fifo_order_within_a_queue() {
    let broker = broker_with(25, 100);
    let q = broker.store().get_queue("q").await.unwrap();
    for jid in ["P1", "P2", "P3"] {
        q.push(&job(jid, "q").to_bytes().unwrap()).await.unwrap();
    }
    let mut popped = Vec::new();
    while let Some(job) = q.pop().await.unwrap() {
        popped.push(job.jid);
    }
    assert_eq!(popped, vec!["P1", "P2", "P3"]);
}

#[tokio::test]
async fn unknown_queue_is_created_empty() {
    let broker = broker_with(25, 100);
    let q = broker.store().get_queue("foobar").await.unwrap();
    assert_eq!(q.size().await, 0);
    assert!(q.peek(10).await.is_empty());
}

#[tokio::test]
async fn add_element_replaces_by_jid() {
    let broker = broker_with(25, 100);
    let retries = broker.store().retries();
    let t1 = now();
    let t2 = t1 + TimeDelta::seconds(30);

    retries.add(t1, job("jid1", "default")).await.unwrap();
    let mut b = job("jid1", "default");
    b.args = Some(json!(["B"]));
    retries.add(t2, b.clone()).await.unwrap();

    assert_eq!(retries.size().await, 1);
    let entry = retries.find("jid1").await.unwrap();
    assert_eq!(entry.key.at, t2);
    assert_eq!(entry.job, b);
}

#[tokio::test]
async fn due_scheduled_job_is_promoted_by_one_tick() {
    let broker = broker_with(25, 100);
    broker
        .store()
        .scheduled()
        .add(now() - TimeDelta::seconds(1), job("s1", "mail"))
        .await
        .unwrap();

    let report = broker.reaper().tick().await;
    assert_eq!(report.scheduled, 1);
    assert_eq!(
        assert_single_home(&broker, "s1").await,
        Location::Queue("mail".into())
    );
    assert_eq!(broker.store().scheduled().size().await, 0);
}

#[tokio::test]
async fn zero_ttl_lease_is_reclaimed_into_retry() {
    let broker = broker_with(25, 100);
    broker.push(job("j1", "default")).await.unwrap();
    broker
        .fetch_one("default", Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let report = broker.reaper().tick().await;
    assert_eq!(report.reclaimed, 1);
    assert_eq!(assert_single_home(&broker, "j1").await, Location::Retries);
    assert_eq!(broker.store().working().size().await, 0);
}

#[tokio::test]
async fn zero_ttl_lease_with_exhausted_retries_goes_dead() {
    let broker = broker_with(1, 100);
    broker.push(job("j1", "default")).await.unwrap();
    broker
        .fetch_one("default", Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let report = broker.reaper().tick().await;
    assert_eq!(report.dead, 1);
    assert_eq!(assert_single_home(&broker, "j1").await, Location::Dead);
}

#[tokio::test]
async fn dead_set_keeps_newest_capacity_entries() {
    let capacity = 5;
    let broker = broker_with(25, capacity);
    let dead = broker.store().dead();
    let base = now() - TimeDelta::hours(1);
    for i in 0..=capacity {
        dead.add(base + TimeDelta::seconds(i as i64), job(&format!("d{i}"), "default"))
            .await
            .unwrap();
    }
    assert_eq!(dead.size().await, capacity);
    assert!(dead.find("d0").await.is_none());
    assert!(dead.find(&format!("d{capacity}")).await.is_some());
}

#[tokio::test]
async fn second_ack_is_not_found_and_changes_nothing() {
    let broker = broker_with(25, 100);
    broker.push(job("j1", "default")).await.unwrap();
    broker.push(job("j2", "default")).await.unwrap();
    broker
        .fetch_one("default", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    broker.ack_job("j1").await.unwrap();
    let before = broker.stats().await;
    let err = broker.ack_job("j1").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
    assert_eq!(broker.stats().await, before);
}

#[tokio::test]
async fn ack_after_reap_is_not_found() {
    let broker = broker_with(25, 100);
    broker.push(job("j1", "default")).await.unwrap();
    broker.fetch_one("default", Duration::ZERO).await.unwrap();
    broker.reaper().tick().await;

    assert!(broker.ack_job("j1").await.unwrap_err().is_not_found());
    assert_eq!(assert_single_home(&broker, "j1").await, Location::Retries);
}

#[tokio::test]
async fn retry_then_dead_lifecycle_keeps_one_home() {
    let broker = Broker::in_memory(BrokerConfig {
        max_retries: 2,
        backoff: broker_core::Backoff::Fixed(Duration::ZERO),
        ..BrokerConfig::default()
    });
    broker.push(job("j1", "default")).await.unwrap();

    for attempt in 1..=2u32 {
        assert!(matches!(
            assert_single_home(&broker, "j1").await,
            Location::Queue(_)
        ));
        broker
            .fetch_one("default", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assert_single_home(&broker, "j1").await, Location::Working);

        let disposition = broker
            .fail_job("j1", FailInfo::new("RuntimeError", format!("attempt {attempt}")))
            .await
            .unwrap();
        if attempt < 2 {
            assert!(matches!(disposition, Disposition::Retry { .. }));
            assert_eq!(assert_single_home(&broker, "j1").await, Location::Retries);
            assert_eq!(broker.reaper().tick().await.retries, 1);
        } else {
            assert_eq!(disposition, Disposition::Dead);
        }
    }

    assert_eq!(assert_single_home(&broker, "j1").await, Location::Dead);
    let dead = broker.store().dead().find("j1").await.unwrap();
    assert_eq!(dead.job.retry_count(), 2);
}

#[tokio::test]
async fn malformed_push_never_reaches_storage() {
    let broker = broker_with(25, 100);
    let err = broker.push_bytes(br#"{"queue":"default"}"#).await.unwrap_err();
    assert!(matches!(err, BrokerError::Validation(_)));
    assert_eq!(broker.stats().await.queues.len(), 0);
}

#[tokio::test]
async fn scheduled_push_reports_its_key() {
    let broker = broker_with(25, 100);
    let mut later = job("later", "default");
    later.at = Some(now() + TimeDelta::hours(1));

    let Pushed::Scheduled { key } = broker.push(later).await.unwrap() else {
        panic!("expected a scheduled job");
    };
    let key: SetKey = key.parse().unwrap();
    let stored = broker.set_entry(SetKind::Scheduled, &key).await.unwrap();
    assert_eq!(stored.jid, "later");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_and_reaper_never_duplicate_a_job() {
    let broker = Arc::new(Broker::in_memory(BrokerConfig {
        backoff: broker_core::Backoff::Fixed(Duration::ZERO),
        ..BrokerConfig::default()
    }));
    let total = 400;

    let mut producers = Vec::new();
    for p in 0..4 {
        let broker = broker.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..total / 4 {
                broker.push(job(&format!("p{p}-{i}"), "work")).await.unwrap();
            }
        }));
    }
    for p in producers {
        p.await.unwrap();
    }

    let reaper = {
        let broker = broker.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                broker.reaper().tick().await;
                tokio::task::yield_now().await;
            }
        })
    };

    let mut workers = Vec::new();
    for w in 0..6 {
        let broker = broker.clone();
        workers.push(tokio::spawn(async move {
            let mut acked = Vec::new();
            let mut idle = 0;
            while idle < 200 {
                match broker.fetch_one("work", Duration::from_secs(60)).await.unwrap() {
                    Some(job) => {
                        idle = 0;
                        // every third job fails once and comes back through Retry
                        if w % 3 == 0 && job.retry_count() == 0 {
                            broker.fail_job(&job.jid, FailInfo::default()).await.unwrap();
                        } else {
                            broker.ack_job(&job.jid).await.unwrap();
                            acked.push(job.jid);
                        }
                    }
                    None => {
                        idle += 1;
                        broker.reaper().tick().await;
                        tokio::task::yield_now().await;
                    }
                }
            }
            acked
        }));
    }

    let mut acked = Vec::new();
    for w in workers {
        acked.extend(w.await.unwrap());
    }
    reaper.await.unwrap();

    let unique: HashSet<_> = acked.iter().cloned().collect();
    assert_eq!(unique.len(), acked.len(), "a job was acked twice");
    assert_eq!(unique.len(), total);
    let stats = broker.stats().await;
    assert_eq!(stats.working, 0);
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.queues["work"], 0);
}
