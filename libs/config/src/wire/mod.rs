use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};

/// top-level config type, as it appears on disk
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_servers")]
    pub servers: MaybeList<String>,
    pub name: Option<String>,
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    #[serde(
        default = "default_reconnect_time_wait",
        deserialize_with = "deserialize_duration"
    )]
    pub reconnect_time_wait: Duration,
    /// per-server bound, negative means unbounded
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: i64,
    #[serde(default)]
    pub no_randomize: bool,
    pub credentials_path: Option<PathBuf>,
    pub nkey_seed_path: Option<PathBuf>,
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,
    #[serde(
        default = "default_ping_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub ping_interval: Duration,
    #[serde(default = "default_max_outstanding_pings")]
    pub max_outstanding_pings: u32,
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
    #[serde(default = "default_subscription_capacity")]
    pub subscription_capacity: usize,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub pedantic: bool,
    #[serde(default = "default_echo")]
    pub echo: bool,
}

pub fn default_servers() -> MaybeList<String> {
    MaybeList::Val(DEFAULT_SERVER.to_owned())
}

pub const DEFAULT_SERVER: &str = "nats://127.0.0.1:4222";

pub const fn default_reconnect() -> bool {
    true
}

pub const fn default_reconnect_time_wait() -> Duration {
    Duration::from_secs(2)
}

pub const fn default_max_reconnect_attempts() -> i64 {
    10
}

pub const fn default_request_timeout() -> Duration {
    Duration::from_secs(2)
}

pub const fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

pub const fn default_ping_interval() -> Duration {
    Duration::from_secs(120)
}

pub const fn default_max_outstanding_pings() -> u32 {
    2
}

pub const fn default_pending_capacity() -> usize {
    1024
}

pub const fn default_subscription_capacity() -> usize {
    512
}

pub const fn default_echo() -> bool {
    true
}

/// Parse a duration string with optional time units
/// Accepts: "2", "500ms", "2s", "1m", "1h"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::Error::msg("empty duration string"));
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis_per_unit = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

impl WireDuration {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        match self {
            WireDuration::Seconds(val) => Ok(Duration::from_secs(val)),
            WireDuration::String(s) => parse_duration(&s).map_err(E::custom),
        }
    }
}

fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    WireDuration::deserialize(de)?.into_duration()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MaybeList<T> {
    Val(T),
    List(Vec<T>),
}

impl<T> MaybeList<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            MaybeList::Val(v) => vec![v],
            MaybeList::List(list) => list,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("0ms").unwrap(), Duration::ZERO);

        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("90m").unwrap(), Duration::from_secs(5400));

        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("60d").is_err());
        assert!(parse_duration("60x").is_err());
        assert!(parse_duration("60mins").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_defaults_from_empty() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.servers, MaybeList::Val(DEFAULT_SERVER.to_owned()));
        assert!(cfg.reconnect);
        assert_eq!(cfg.reconnect_time_wait, Duration::from_secs(2));
        assert_eq!(cfg.max_reconnect_attempts, 10);
        assert_eq!(cfg.ping_interval, Duration::from_secs(120));
        assert!(cfg.echo);
        assert!(cfg.credentials_path.is_none());
    }

    #[test]
    fn test_durations_mixed() {
        let json = r#"{"reconnect_time_wait": "500ms", "request_timeout": 3}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.reconnect_time_wait, Duration::from_millis(500));
        assert_eq!(cfg.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_servers_single_or_list() {
        let cfg: Config = serde_json::from_str(r#"{"servers": "nats://a:4222"}"#).unwrap();
        assert_eq!(cfg.servers.into_vec(), vec!["nats://a:4222".to_owned()]);

        let cfg: Config =
            serde_json::from_str(r#"{"servers": ["nats://a:4222", "nats://b:4222"]}"#).unwrap();
        assert_eq!(cfg.servers.into_vec().len(), 2);
    }
}
