//! Append-only journal behind a durable store.
//!
//! One JSON line per mutation. A move between structures is a single record
//! naming both ends, so replay resolves every job to exactly one place no
//! matter where a crash interrupted the live process. A torn final line
//! (crash mid-write) is dropped; damage anywhere else refuses to open.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::error::{BrokerError, Result};
use crate::job::{Jid, JobRecord};
use crate::sorted::{SetKey, SetKind, SetState};
use crate::working::{Lease, WorkingState};

pub const JOURNAL_FILE: &str = "journal.log";

/// Where a moved job came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "in", rename_all = "snake_case")]
pub enum Source {
    Queue { queue: String, jid: Jid },
    Set { set: SetKind, key: SetKey },
    Working { jid: Jid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Declare {
        queue: String,
    },
    Push {
        queue: String,
        job: JobRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<Source>,
    },
    Add {
        set: SetKind,
        key: SetKey,
        job: JobRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<Source>,
    },
    Lease {
        lease: Lease,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<Source>,
    },
    Remove {
        from: Source,
    },
    ClearQueue {
        queue: String,
    },
    ClearSet {
        set: SetKind,
    },
}

/// When a live journal is worth compacting: at least `min_records` appends
/// since the last rewrite, and more than `ratio` times the records a rewrite
/// would keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    pub min_records: usize,
    pub ratio: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            min_records: 10_000,
            ratio: 2,
        }
    }
}

impl CompactionPolicy {
    fn is_due(&self, appended: usize, live: usize) -> bool {
        self.min_records > 0
            && appended >= self.min_records
            && appended > live.saturating_mul(self.ratio)
    }
}

pub struct Journal {
    path: PathBuf,
    sync: bool,
    writer: Mutex<Writer>,
}

/// The append handle plus the bookkeeping that must change with it.
struct Writer {
    file: File,
    /// Bytes of whole records in the file; a failed append is cut back to this.
    len: u64,
    /// Records appended since the last rewrite.
    appended: usize,
    /// Records the last rewrite wrote.
    live: usize,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
    /// Bytes to write before the next append fails.
    #[cfg(test)]
    fail_next: Option<usize>,
}

impl Writer {
    async fn open(path: &Path, live: usize) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Writer {
            file,
            len,
            appended: 0,
            live,
            poisoned: false,
            #[cfg(test)]
            fail_next: None,
        })
    }

    async fn write_line(&mut self, line: &[u8], sync: bool) -> std::io::Result<()> {
        #[cfg(test)]
        if let Some(written) = self.fail_next.take() {
            self.file.write_all(&line[..written.min(line.len())]).await?;
            self.file.flush().await?;
            return Err(std::io::Error::other("injected journal write failure"));
        }
        self.file.write_all(line).await?;
        self.file.flush().await?;
        if sync {
            self.file.sync_data().await?;
        }
        Ok(())
    }
}

impl Journal {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn poisoned(&self) -> BrokerError {
        BrokerError::Storage(format!(
            "journal {} is unwritable after a failed rollback",
            self.path.display()
        ))
    }

    /// Append one record. On failure the file is cut back to its last whole
    /// record, so a later append never lands behind a fragment.
    pub(crate) async fn append(&self, op: &Op) -> Result<()> {
        let mut line = serde_json::to_vec(op)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        if writer.poisoned {
            return Err(self.poisoned());
        }
        if let Err(e) = writer.write_line(&line, self.sync).await {
            let len = writer.len;
            if let Err(cut) = writer.file.set_len(len).await {
                writer.poisoned = true;
                tracing::error!(path = %self.path.display(), error = %cut, "journal rollback failed");
            }
            return Err(e.into());
        }
        writer.len += line.len() as u64;
        writer.appended += 1;
        Ok(())
    }

    /// Read every intact record from `dir`. A missing journal is an empty one.
    pub(crate) async fn read(dir: &Path) -> Result<Vec<Op>> {
        let path = dir.join(JOURNAL_FILE);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        parse_records(&raw, &path)
    }

    /// Replace the journal in `dir` with `ops` and open it for appending.
    ///
    /// Written to a temporary file and renamed over the old journal, so a
    /// crash mid-compaction leaves the previous journal intact.
    pub(crate) async fn rewrite(dir: &Path, ops: &[Op], sync: bool) -> Result<Journal> {
        let path = dir.join(JOURNAL_FILE);
        let tmp = tmp_path(&path);
        write_records(&tmp, ops).await?;
        fs::rename(&tmp, &path).await?;

        let writer = Writer::open(&path, ops.len()).await?;
        Ok(Journal {
            path,
            sync,
            writer: Mutex::new(writer),
        })
    }

    pub(crate) async fn compaction_due(&self, policy: &CompactionPolicy) -> bool {
        let writer = self.writer.lock().await;
        !writer.poisoned && policy.is_due(writer.appended, writer.live)
    }

    /// Shrink the live journal to the records that rebuild its current state.
    ///
    /// The state comes from replaying the file itself, not from the live
    /// structures, so no structure lock is taken. Appends keep flowing while
    /// the snapshot is built and written; the writer lock is only held to copy
    /// the records that arrived meanwhile and to swap the file. Returns the
    /// record count of the new journal, or `None` when the file changed under
    /// the snapshot and the attempt was abandoned.
    pub(crate) async fn compact(&self, dead_capacity: Option<usize>) -> Result<Option<usize>> {
        let raw = fs::read(&self.path).await?;
        // an append may be mid-flight; only whole lines belong to the prefix
        let prefix = raw.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        let mut state = Recovered::new(dead_capacity);
        for op in parse_records(&raw[..prefix], &self.path)? {
            state.apply(op);
        }
        let snapshot = state.snapshot();
        let tmp = tmp_path(&self.path);
        write_records(&tmp, &snapshot).await?;

        let mut writer = self.writer.lock().await;
        if writer.poisoned {
            return Err(self.poisoned());
        }
        let mut current = fs::read(&self.path).await?;
        current.truncate(writer.len as usize);
        // a rolled-back append can take back bytes the snapshot already read
        if current.get(..prefix) != Some(&raw[..prefix]) {
            tracing::debug!(path = %self.path.display(), "journal moved during compaction; retrying later");
            let _ = fs::remove_file(&tmp).await;
            return Ok(None);
        }
        let tail = &current[prefix..];
        let tail_records = tail.iter().filter(|b| **b == b'\n').count();

        let mut out = OpenOptions::new().append(true).open(&tmp).await?;
        out.write_all(tail).await?;
        out.sync_all().await?;
        drop(out);
        fs::rename(&tmp, &self.path).await?;

        let live = snapshot.len() + tail_records;
        *writer = Writer::open(&self.path, live).await?;
        tracing::info!(
            path = %self.path.display(),
            before = current.len(),
            after = writer.len,
            records = live,
            "journal compacted"
        );
        Ok(Some(live))
    }

    #[cfg(test)]
    pub(crate) async fn fail_next_append(&self, written: usize) {
        self.writer.lock().await.fail_next = Some(written);
    }
}

fn parse_records(raw: &[u8], path: &Path) -> Result<Vec<Op>> {
    let lines: Vec<&[u8]> = raw
        .split(|b| *b == b'\n')
        .filter(|l| !l.iter().all(u8::is_ascii_whitespace))
        .collect();
    let last = lines.len().saturating_sub(1);

    let mut ops = Vec::with_capacity(lines.len());
    for (n, line) in lines.into_iter().enumerate() {
        match serde_json::from_slice::<Op>(line) {
            Ok(op) => ops.push(op),
            Err(e) if n == last => {
                tracing::warn!(path = %path.display(), error = %e, "dropping torn journal tail");
            }
            Err(e) => {
                return Err(BrokerError::Storage(format!(
                    "corrupt journal record {} in {}: {e}",
                    n + 1,
                    path.display()
                )));
            }
        }
    }
    Ok(ops)
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("log.tmp")
}

/// Write `ops` to a fresh file at `tmp` and sync it.
async fn write_records(tmp: &Path, ops: &[Op]) -> Result<()> {
    let mut out = BufWriter::new(File::create(tmp).await?);
    for op in ops {
        let mut line = serde_json::to_vec(op)?;
        line.push(b'\n');
        out.write_all(&line).await?;
    }
    out.flush().await?;
    out.into_inner().sync_all().await?;
    Ok(())
}

/// Store contents rebuilt from journal records.
#[derive(Debug)]
pub(crate) struct Recovered {
    pub(crate) queues: BTreeMap<String, VecDeque<JobRecord>>,
    pub(crate) scheduled: SetState,
    pub(crate) retries: SetState,
    pub(crate) dead: SetState,
    pub(crate) working: WorkingState,
}

impl Recovered {
    pub(crate) fn new(dead_capacity: Option<usize>) -> Self {
        Self {
            queues: BTreeMap::new(),
            scheduled: SetState::new(None),
            retries: SetState::new(None),
            dead: SetState::new(dead_capacity),
            working: WorkingState::default(),
        }
    }

    fn set_mut(&mut self, kind: SetKind) -> &mut SetState {
        match kind {
            SetKind::Scheduled => &mut self.scheduled,
            SetKind::Retries => &mut self.retries,
            SetKind::Dead => &mut self.dead,
        }
    }

    pub(crate) fn apply(&mut self, op: Op) {
        match op {
            Op::Declare { queue } => {
                self.queues.entry(queue).or_default();
            }
            Op::Push { queue, job, from } => {
                self.detach(from);
                self.queues.entry(queue).or_default().push_back(job);
            }
            Op::Add { set, key, job, from } => {
                self.detach(from);
                self.set_mut(set).insert(key, job);
            }
            Op::Lease { lease, from } => {
                self.detach(from);
                // the newer record wins if a jid somehow appears twice
                self.working.remove(&lease.job.jid);
                let _ = self.working.insert(lease);
            }
            Op::Remove { from } => self.detach(Some(from)),
            Op::ClearQueue { queue } => {
                self.queues.entry(queue).or_default().clear();
            }
            Op::ClearSet { set } => {
                self.set_mut(set).clear();
            }
        }
    }

    fn detach(&mut self, from: Option<Source>) {
        let found = match &from {
            None => return,
            Some(Source::Queue { queue, jid }) => self
                .queues
                .get_mut(queue)
                .and_then(|jobs| {
                    let pos = jobs.iter().position(|j| &j.jid == jid)?;
                    jobs.remove(pos)
                })
                .is_some(),
            Some(Source::Set { set, key }) => self.set_mut(*set).remove(key).is_some(),
            Some(Source::Working { jid }) => self.working.remove(jid).is_some(),
        };
        if !found {
            tracing::debug!(source = ?from, "journal source already gone during replay");
        }
    }

    /// The minimal record list that rebuilds the current state.
    pub(crate) fn snapshot(&self) -> Vec<Op> {
        let mut ops = Vec::new();
        for (name, jobs) in &self.queues {
            ops.push(Op::Declare {
                queue: name.clone(),
            });
            ops.extend(jobs.iter().map(|job| Op::Push {
                queue: name.clone(),
                job: job.clone(),
                from: None,
            }));
        }
        for (kind, state) in [
            (SetKind::Scheduled, &self.scheduled),
            (SetKind::Retries, &self.retries),
            (SetKind::Dead, &self.dead),
        ] {
            ops.extend(state.entries().map(|(key, job)| Op::Add {
                set: kind,
                key: key.clone(),
                job: job.clone(),
                from: None,
            }));
        }
        ops.extend(self.working.leases().map(|lease| Op::Lease {
            lease: lease.clone(),
            from: None,
        }));
        ops
    }
}
