//! Time-ordered job sets keyed by `(timestamp, jid)`.
//!
//! One set type serves three roles: jobs scheduled for the future, jobs
//! waiting for their next retry, and the capacity-bounded dead set.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::Mutex;

use crate::error::{BrokerError, Result};
use crate::job::{Jid, JobRecord, format_ts, parse_ts, truncate};
use crate::journal::{Journal, Op, Source};

pub const KEY_SEPARATOR: char = '|';

const SCAN_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetKind {
    Scheduled,
    Retries,
    Dead,
}

impl SetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetKind::Scheduled => "scheduled",
            SetKind::Retries => "retries",
            SetKind::Dead => "dead",
        }
    }
}

impl fmt::Display for SetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SetKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(SetKind::Scheduled),
            "retries" | "retry" => Ok(SetKind::Retries),
            "dead" | "morgue" => Ok(SetKind::Dead),
            other => Err(BrokerError::Validation(format!("unknown set: {other}"))),
        }
    }
}

/// Address of one entry: `"{timestamp}|{jid}"` on the outside.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetKey {
    pub at: DateTime<Utc>,
    pub jid: Jid,
}

impl SetKey {
    pub fn new(at: DateTime<Utc>, jid: impl Into<Jid>) -> Self {
        Self {
            at: truncate(at),
            jid: jid.into(),
        }
    }
}

impl fmt::Display for SetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", format_ts(&self.at), KEY_SEPARATOR, self.jid)
    }
}

impl FromStr for SetKey {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BrokerError::Validation(format!("invalid key: {s}"));
        let (ts, jid) = s.split_once(KEY_SEPARATOR).ok_or_else(invalid)?;
        if jid.is_empty() {
            return Err(invalid());
        }
        let at = parse_ts(ts).ok_or_else(invalid)?;
        Ok(SetKey::new(at, jid))
    }
}

impl Serialize for SetKey {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SetKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetEntry {
    pub key: SetKey,
    pub job: JobRecord,
}

/// The unlocked contents of a set; shared by live sets and journal replay.
#[derive(Debug, Default)]
pub(crate) struct SetState {
    entries: BTreeMap<SetKey, JobRecord>,
    by_jid: HashMap<Jid, DateTime<Utc>>,
    capacity: Option<usize>,
}

impl SetState {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity: capacity.filter(|c| *c > 0),
            ..Self::default()
        }
    }

    /// Insert-or-replace by jid. Returns entries evicted to stay within capacity.
    pub(crate) fn insert(&mut self, key: SetKey, job: JobRecord) -> Vec<SetEntry> {
        if let Some(old_at) = self.by_jid.remove(&key.jid) {
            self.entries.remove(&SetKey::new(old_at, key.jid.clone()));
        }

        let mut evicted = Vec::new();
        if let Some(cap) = self.capacity {
            while self.entries.len() >= cap {
                let Some((old_key, old_job)) = self.entries.pop_first() else {
                    break;
                };
                self.by_jid.remove(&old_key.jid);
                evicted.push(SetEntry {
                    key: old_key,
                    job: old_job,
                });
            }
        }

        self.by_jid.insert(key.jid.clone(), key.at);
        self.entries.insert(key, job);
        evicted
    }

    pub(crate) fn remove(&mut self, key: &SetKey) -> Option<JobRecord> {
        let job = self.entries.remove(key)?;
        self.by_jid.remove(&key.jid);
        Some(job)
    }

    pub(crate) fn contains(&self, key: &SetKey) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.by_jid.clear();
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&SetKey, &JobRecord)> {
        self.entries.iter()
    }

    fn due_after(&self, cursor: Option<&SetKey>, now: DateTime<Utc>, limit: usize) -> Vec<SetEntry> {
        let lower = match cursor {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        self.entries
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.at <= now)
            .take(limit)
            .map(|(key, job)| SetEntry {
                key: key.clone(),
                job: job.clone(),
            })
            .collect()
    }
}

pub struct TimeIndexedSet {
    kind: SetKind,
    state: Mutex<SetState>,
    journal: Option<Arc<Journal>>,
}

impl TimeIndexedSet {
    pub(crate) fn from_state(kind: SetKind, state: SetState, journal: Option<Arc<Journal>>) -> Self {
        Self {
            kind,
            state: Mutex::new(state),
            journal,
        }
    }

    /// Insert-or-replace `job` at `at`. Fails only if the journal write fails.
    pub async fn add(&self, at: DateTime<Utc>, job: JobRecord) -> Result<SetKey> {
        self.insert(at, job, None).await
    }

    pub(crate) async fn insert(
        &self,
        at: DateTime<Utc>,
        job: JobRecord,
        from: Option<Source>,
    ) -> Result<SetKey> {
        let key = SetKey::new(at, job.jid.clone());
        let mut state = self.state.lock().await;
        if let Some(journal) = &self.journal {
            journal
                .append(&Op::Add {
                    set: self.kind,
                    key: key.clone(),
                    job: job.clone(),
                    from,
                })
                .await?;
        }
        for gone in state.insert(key.clone(), job) {
            tracing::debug!(set = %self.kind, key = %gone.key, "evicted oldest entry at capacity");
        }
        Ok(key)
    }

    /// Exact-key removal. `Ok(None)` when the entry is already gone.
    pub async fn remove(&self, key: &SetKey) -> Result<Option<JobRecord>> {
        let mut state = self.state.lock().await;
        if !state.contains(key) {
            return Ok(None);
        }
        if let Some(journal) = &self.journal {
            journal
                .append(&Op::Remove {
                    from: Source::Set {
                        set: self.kind,
                        key: key.clone(),
                    },
                })
                .await?;
        }
        Ok(state.remove(key))
    }

    /// Detach an entry for a move; the destination journals the move.
    pub(crate) async fn take(&self, key: &SetKey) -> Option<JobRecord> {
        self.state.lock().await.remove(key)
    }

    /// Undo a `take` whose destination write failed.
    pub(crate) async fn restore(&self, key: SetKey, job: JobRecord) {
        self.state.lock().await.insert(key, job);
    }

    /// Entries due at `now`, ascending. Each call starts a fresh scan.
    pub fn scan_due(&self, now: DateTime<Utc>) -> DueScan<'_> {
        DueScan {
            set: self,
            now,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn clear(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        if let Some(journal) = &self.journal {
            journal.append(&Op::ClearSet { set: self.kind }).await?;
        }
        Ok(state.clear())
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn get(&self, key: &SetKey) -> Option<JobRecord> {
        self.state.lock().await.entries.get(key).cloned()
    }

    pub async fn find(&self, jid: &str) -> Option<SetEntry> {
        let state = self.state.lock().await;
        let at = state.by_jid.get(jid)?;
        let key = SetKey::new(*at, jid);
        let job = state.entries.get(&key)?.clone();
        Some(SetEntry { key, job })
    }

    /// Read-only page in key order, for display.
    pub async fn page(&self, offset: usize, limit: usize) -> Vec<SetEntry> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(key, job)| SetEntry {
                key: key.clone(),
                job: job.clone(),
            })
            .collect()
    }
}

/// Lazy ascending walk over due entries.
///
/// Batches are read under the lock and the cursor only moves forward, so an
/// entry is yielded at most once per scan even while the set changes.
pub struct DueScan<'a> {
    set: &'a TimeIndexedSet,
    now: DateTime<Utc>,
    cursor: Option<SetKey>,
    buffer: VecDeque<SetEntry>,
    exhausted: bool,
}

impl DueScan<'_> {
    pub async fn next(&mut self) -> Option<SetEntry> {
        if self.buffer.is_empty() && !self.exhausted {
            let set = self.set;
            let batch = {
                let state = set.state.lock().await;
                state.due_after(self.cursor.as_ref(), self.now, SCAN_BATCH)
            };
            self.exhausted = batch.len() < SCAN_BATCH;
            self.cursor = batch.last().map(|e| e.key.clone());
            self.buffer.extend(batch);
        }
        self.buffer.pop_front()
    }

    pub async fn collect(mut self) -> Vec<SetEntry> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await {
            out.push(entry);
        }
        out
    }
}
