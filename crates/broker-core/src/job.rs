use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BrokerError, Result};

pub type Jid = String;

pub const DEFAULT_QUEUE: &str = "default";

/// Timestamps are kept at microsecond precision so they survive a round trip
/// through their string form (set keys, journal records) unchanged.
pub fn truncate(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

pub fn format_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| truncate(dt.with_timezone(&Utc)))
}

/// The latest instant that still formats as a four-digit RFC 3339 year,
/// 9999-12-31T23:59:59.999999Z.
pub fn latest() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 999_999_000).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `at + d`, clamped to [`latest`] so the result always parses back.
pub fn after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let latest = latest();
    TimeDelta::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .map_or(latest, |t| truncate(t.min(latest)))
}

/// Optional RFC 3339 timestamps. Producers send `""` for "not set".
mod opt_ts {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    use super::{format_ts, parse_ts};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => s.serialize_str(&format_ts(at)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => parse_ts(s)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, with = "opt_ts", skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "opt_ts", skip_serializing_if = "Option::is_none")]
    pub next_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Vec<String>>,
}

/// A job as producers send it. `args`, `custom` and any unknown top-level
/// fields are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub jid: Jid,
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub jobtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,

    #[serde(default, with = "opt_ts", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "opt_ts", skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default, with = "opt_ts", skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,

    /// Per-job override of the broker's retry limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<i64>,
    /// Lease length in seconds, overriding the TTL passed to fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_for: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobRecord {
    pub fn new(jid: impl Into<Jid>, jobtype: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            queue: queue.into(),
            jobtype: jobtype.into(),
            args: None,
            created_at: None,
            enqueued_at: None,
            at: None,
            retry: None,
            reserve_for: None,
            failure: None,
            custom: None,
            extra: Map::new(),
        }
    }

    /// Decode and validate a wire payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let job: JobRecord = serde_json::from_slice(payload)
            .map_err(|e| BrokerError::Validation(format!("malformed payload: {e}")))?;
        job.validated()
    }

    /// Normalizes defaults and rejects envelopes the core cannot route.
    pub fn validated(mut self) -> Result<Self> {
        self.jid = self.jid.trim().to_string();
        if self.jid.is_empty() {
            return Err(BrokerError::Validation("jid is required".into()));
        }
        if self.jobtype.trim().is_empty() {
            return Err(BrokerError::Validation(format!(
                "job {} has no jobtype",
                self.jid
            )));
        }
        let queue = self.queue.trim();
        self.queue = if queue.is_empty() {
            DEFAULT_QUEUE.to_string()
        } else {
            queue.to_string()
        };
        Ok(self)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn retry_count(&self) -> u32 {
        self.failure.as_ref().map(|f| f.retry_count).unwrap_or(0)
    }

    /// `Some(at)` when the job must wait in the scheduled set.
    pub fn scheduled_for(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.at.filter(|at| *at > now)
    }

    pub fn max_retries(&self, default: u32) -> u32 {
        match self.retry {
            Some(n) => u32::try_from(n.max(0)).unwrap_or(u32::MAX),
            None => default,
        }
    }

    pub fn lease_ttl(&self, requested: Duration) -> Duration {
        match self.reserve_for {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => requested,
        }
    }
}
