use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use broker_core::{Backoff, BrokerConfig, CompactionPolicy};

pub const DEFAULT_BIND: &str = "0.0.0.0:7419";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    /// Journal directory; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub broker: BrokerConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let bind = get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind
            .parse()
            .with_context(|| format!("BIND_ADDR must be a valid socket address, got {bind:?}"))?;

        let data_dir = get("BROKER_DATA_DIR")
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);

        let defaults = BrokerConfig::default();
        let (default_base, default_max) = match defaults.backoff {
            Backoff::Exponential { base, max } => (base, max),
            _ => (Duration::from_secs(15), Duration::from_secs(3600)),
        };

        let broker = BrokerConfig {
            max_retries: parse_or(&get, "BROKER_MAX_RETRIES", defaults.max_retries),
            dead_capacity: parse_or(&get, "BROKER_DEAD_CAPACITY", defaults.dead_capacity),
            reaper_interval: millis_or(&get, "BROKER_REAPER_INTERVAL_MS", defaults.reaper_interval),
            default_lease: millis_or(&get, "BROKER_LEASE_MS", defaults.default_lease),
            backoff: Backoff::Exponential {
                base: millis_or(&get, "BROKER_BACKOFF_BASE_MS", default_base),
                max: millis_or(&get, "BROKER_BACKOFF_MAX_MS", default_max),
            },
            sync_writes: parse_or(&get, "BROKER_SYNC_WRITES", defaults.sync_writes),
            compaction: CompactionPolicy {
                min_records: parse_or(
                    &get,
                    "BROKER_COMPACT_MIN_RECORDS",
                    defaults.compaction.min_records,
                ),
                ..defaults.compaction
            },
        };

        Ok(Self {
            bind,
            data_dir,
            broker,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match get(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, ?default, "ignoring malformed setting");
                default
            }
        },
    }
}

fn millis_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    let ms = parse_or(get, key, default.as_millis() as u64);
    Duration::from_millis(ms)
}
