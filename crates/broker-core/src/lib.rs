//! Storage and scheduling core of the job broker.
//!
//! Jobs live in exactly one of: a named FIFO queue, the scheduled set, the
//! retry set, the dead set, or the working set of leased jobs. [`Broker`]
//! moves them on push/fetch/ack/fail and the [`Reaper`] moves them on a
//! timer. A [`Store`] opened on a directory journals every move so that a
//! restart puts each job back in exactly one place.

pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod job;
pub mod journal;
pub mod queue;
pub mod reaper;
pub mod retry;
pub mod sorted;
pub mod store;
pub mod working;

pub use api::{JobBroker, Pushed};
pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use job::{DEFAULT_QUEUE, Failure, Jid, JobRecord};
pub use journal::CompactionPolicy;
pub use queue::FifoQueue;
pub use reaper::{Reaper, TickReport};
pub use retry::{Backoff, Disposition, FailInfo, RetryPolicy};
pub use sorted::{KEY_SEPARATOR, SetEntry, SetKey, SetKind, TimeIndexedSet};
pub use store::{Location, Stats, Store, StoreOptions};
pub use working::{Lease, WorkingSet};
