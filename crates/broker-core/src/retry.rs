use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Failure, JobRecord, after};

/// Delay before the next attempt, as a function of the retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^(n-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// `step * n`, capped at `max`.
    Linear { step: Duration, max: Duration },
    Fixed(Duration),
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_secs(15),
            max: Duration::from_secs(3600),
        }
    }
}

impl Backoff {
    pub fn delay(&self, retry_count: u32) -> Duration {
        let n = retry_count.max(1);
        match *self {
            Backoff::Exponential { base, max } => {
                let shift = (n - 1).min(31);
                base.saturating_mul(1u32 << shift).min(max)
            }
            Backoff::Linear { step, max } => step.saturating_mul(n).min(max),
            Backoff::Fixed(d) => d,
        }
    }
}

/// What a worker reports about a failed attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailInfo {
    #[serde(default)]
    pub errtype: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub backtrace: Option<Vec<String>>,
}

impl FailInfo {
    pub fn new(errtype: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errtype: Some(errtype.into()),
            message: Some(message.into()),
            backtrace: None,
        }
    }

    pub(crate) fn lease_expired() -> Self {
        Self::new("LeaseExpired", "job was not acknowledged before its lease expired")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "to")]
pub enum Disposition {
    Retry { at: DateTime<Utc> },
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 25,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Bump the job's retry count, stamp the failure and pick its next home.
    pub fn record_failure(
        &self,
        job: &mut JobRecord,
        info: FailInfo,
        now: DateTime<Utc>,
    ) -> Disposition {
        let retry_count = job.retry_count().saturating_add(1);
        let disposition = if retry_count < job.max_retries(self.max_retries) {
            Disposition::Retry {
                at: after(now, self.backoff.delay(retry_count)),
            }
        } else {
            Disposition::Dead
        };

        job.failure = Some(Failure {
            retry_count,
            failed_at: Some(now),
            next_at: match disposition {
                Disposition::Retry { at } => Some(at),
                Disposition::Dead => None,
            },
            message: info.message,
            errtype: info.errtype,
            backtrace: info.backtrace,
        });
        disposition
    }
}
