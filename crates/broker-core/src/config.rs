use std::time::Duration;

use crate::journal::CompactionPolicy;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::StoreOptions;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Attempts before a job is moved to the dead set, unless the job sets `retry`.
    pub max_retries: u32,
    pub dead_capacity: usize,
    pub reaper_interval: Duration,
    /// Lease length when a fetch does not ask for one.
    pub default_lease: Duration,
    pub backoff: Backoff,
    pub sync_writes: bool,
    pub compaction: CompactionPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_retries: 25,
            dead_capacity: 10_000,
            reaper_interval: Duration::from_secs(5),
            default_lease: Duration::from_secs(1800),
            backoff: Backoff::default(),
            sync_writes: false,
            compaction: CompactionPolicy::default(),
        }
    }
}

impl BrokerConfig {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            dead_capacity: self.dead_capacity,
            sync_writes: self.sync_writes,
            compaction: self.compaction,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: self.backoff,
        }
    }
}
