//! Configuration module for the skyfeed application.
//!
//! Values come from environment variables (after `.env` is loaded) through
//! figment. Durations accept plain seconds or human strings like `90s` or `5m`.

use anyhow::Context;
use figment::Figment;
use figment::providers::Env;
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Log level for the skyfeed crate; `RUST_LOG` overrides it entirely.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub database_url: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,

    #[serde(default = "default_scheduler_tick", deserialize_with = "deserialize_duration")]
    pub scheduler_tick: Duration,
    #[serde(default = "default_cleanup_interval", deserialize_with = "deserialize_duration")]
    pub cleanup_interval: Duration,
    /// Reset sources and jobs left running by a previous process.
    #[serde(default = "default_true")]
    pub recover_on_startup: bool,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_queue_poll_interval", deserialize_with = "deserialize_duration")]
    pub queue_poll_interval: Duration,
    #[serde(default = "default_queue_retry_limit")]
    pub queue_retry_limit: i32,
    #[serde(default = "default_queue_retry_delay", deserialize_with = "deserialize_duration")]
    pub queue_retry_delay: Duration,
    #[serde(
        default = "default_queue_retry_delay_max",
        deserialize_with = "deserialize_duration"
    )]
    pub queue_retry_delay_max: Duration,

    #[serde(default = "default_http_timeout", deserialize_with = "deserialize_duration")]
    pub http_timeout: Duration,
    /// Per-feed outbound request quota.
    #[serde(default = "default_outbound_rpm")]
    pub outbound_requests_per_minute: u32,
    #[serde(default = "default_metar_retention", deserialize_with = "deserialize_duration")]
    pub metar_retention: Duration,
    #[serde(default = "default_awc_base_url")]
    pub awc_base_url: String,
    #[serde(default = "default_xweather_base_url")]
    pub xweather_base_url: String,
    pub xweather_client_id: Option<String>,
    pub xweather_client_secret: Option<String>,

    /// Bearer token required on admin routes. Unset leaves them open.
    pub admin_token: Option<String>,
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> anyhow::Result<Self> {
        Figment::new()
            .merge(Env::raw())
            .extract()
            .context("Failed to load config")
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_scheduler_tick() -> Duration {
    Duration::from_secs(60)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_true() -> bool {
    true
}

fn default_worker_concurrency() -> usize {
    3
}

fn default_queue_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_queue_retry_limit() -> i32 {
    2
}

fn default_queue_retry_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_queue_retry_delay_max() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_outbound_rpm() -> u32 {
    120
}

fn default_metar_retention() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_awc_base_url() -> String {
    "https://aviationweather.gov/api/data".to_owned()
}

fn default_xweather_base_url() -> String {
    "https://data.api.xweather.com".to_owned()
}

fn duration_parser() -> DurationParser<'static> {
    DurationParser::with_time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
        TimeUnit::Day,
    ])
}

/// Parse `"90"`, `"90s"`, `"5m"` or `"250ms"` into a `Duration`. Bare numbers are seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let parsed = duration_parser()
        .parse(input.trim())
        .map_err(|e| format!("invalid duration '{input}': {e}"))?;
    Duration::try_from(parsed).map_err(|e| format!("invalid duration '{input}': {e}"))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::{Format, Toml};

    fn extract(toml: &str) -> Result<Config, figment::Error> {
        Figment::from(Toml::string(toml)).extract()
    }

    #[test]
    fn defaults_apply() {
        let config = extract(r#"database_url = "postgres://localhost/skyfeed""#).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.scheduler_tick, Duration::from_secs(60));
        assert_eq!(config.worker_concurrency, 3);
        assert_eq!(config.queue_retry_delay_max, Duration::from_secs(600));
        assert!(config.recover_on_startup);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn durations_accept_seconds_and_units() {
        let config = extract(
            r#"
            database_url = "postgres://localhost/skyfeed"
            scheduler_tick = 90
            cleanup_interval = "5m"
            queue_poll_interval = "250ms"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler_tick, Duration::from_secs(90));
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.queue_poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let err = extract(
            r#"
            database_url = "postgres://localhost/skyfeed"
            http_timeout = "soon"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid duration"));
    }

    #[test]
    fn parse_duration_treats_bare_numbers_as_seconds() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }
}
