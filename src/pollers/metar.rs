//! METAR observations from the Aviation Weather Center, upserted per station.

use crate::data::models::SourceDescriptor;
use crate::pollers::backoff::Backoff;
use crate::pollers::http::{FeedClient, FeedError};
use crate::pollers::store::{Keyed, UpsertStore};
use crate::pollers::{PollOutcome, Poller, Sweeper};
use crate::utils::fmt_duration;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub const SOURCE_KEY: &str = "metar_poll";

/// AWC station groups are queried one state at a time.
pub const US_STATES: [&str; 50] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA", "KS",
    "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ", "NM", "NY",
    "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT", "VA", "WA", "WV",
    "WI", "WY",
];

/// One report as returned by `GET /metar?format=json`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetarReport {
    pub icao_id: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub raw_ob: Option<String>,
    #[serde(rename = "fltCat")]
    pub flight_category: Option<String>,
    pub temp: Option<f64>,
    pub dewp: Option<f64>,
    /// Degrees, or `"VRB"`.
    pub wdir: Option<Value>,
    pub wspd: Option<i32>,
    pub wgst: Option<i32>,
    /// Statute miles, or a string such as `"10+"`.
    pub visib: Option<Value>,
    pub altim: Option<f64>,
    pub clouds: Option<Value>,
    pub obs_time: Option<i64>,
    pub report_time: Option<String>,
}

/// A row of the `metars` table, keyed by station.
#[derive(Debug, Clone, PartialEq)]
pub struct Metar {
    pub icao_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub raw_ob: Option<String>,
    pub flight_category: Option<String>,
    pub temp: Option<f64>,
    pub dewp: Option<f64>,
    pub wdir: Option<i32>,
    pub wspd: Option<i32>,
    pub wgst: Option<i32>,
    pub visib: Option<f64>,
    pub altim: Option<f64>,
    pub clouds: Option<Value>,
    pub obs_time: Option<i64>,
    pub report_time: Option<String>,
}

impl Keyed for Metar {
    type Key = String;

    fn key(&self) -> String {
        self.icao_id.clone()
    }
}

impl Metar {
    fn from_report(icao_id: String, report: MetarReport) -> Self {
        Self {
            icao_id,
            latitude: report.lat,
            longitude: report.lon,
            raw_ob: report.raw_ob,
            flight_category: report.flight_category,
            temp: report.temp,
            dewp: report.dewp,
            wdir: report
                .wdir
                .as_ref()
                .and_then(Value::as_i64)
                .and_then(|v| i32::try_from(v).ok()),
            wspd: report.wspd,
            wgst: report.wgst,
            visib: report.visib.as_ref().and_then(Value::as_f64),
            altim: report.altim,
            clouds: report.clouds,
            obs_time: report.obs_time,
            report_time: report.report_time,
        }
    }
}

/// Keep only the newest report per station, dropping reports without a station id.
pub fn latest_per_station(reports: impl IntoIterator<Item = MetarReport>) -> Vec<Metar> {
    let mut latest: HashMap<String, MetarReport> = HashMap::new();
    for report in reports {
        let Some(id) = report.icao_id.clone().filter(|id| !id.is_empty()) else {
            continue;
        };
        let newer = latest
            .get(&id)
            .is_none_or(|existing| report.obs_time.unwrap_or(0) > existing.obs_time.unwrap_or(0));
        if newer {
            latest.insert(id, report);
        }
    }

    let mut metars: Vec<Metar> = latest
        .into_iter()
        .map(|(id, report)| Metar::from_report(id, report))
        .collect();
    metars.sort_by(|a, b| a.icao_id.cmp(&b.icao_id));
    metars
}

#[async_trait]
pub trait MetarFeed: Send + Sync {
    /// Reports from the last few hours for one state.
    async fn fetch_region(&self, state: &str) -> Result<Vec<MetarReport>, FeedError>;
}

pub struct AwcMetarFeed {
    client: FeedClient,
    base_url: String,
}

impl AwcMetarFeed {
    pub fn new(client: FeedClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl MetarFeed for AwcMetarFeed {
    async fn fetch_region(&self, state: &str) -> Result<Vec<MetarReport>, FeedError> {
        let url = format!("{}/metar", self.base_url);
        let ids = format!("@{state}");
        self.client
            .get_json(&url, &[("ids", ids.as_str()), ("format", "json"), ("hours", "3")])
            .await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetarSettings {
    pub batch_size: usize,
    /// Pause between batches, escalated after a batch with failures.
    pub batch_delay: Duration,
    pub max_batch_delay: Duration,
    /// Backoff applied to rate-limited fetches.
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for MetarSettings {
    fn default() -> Self {
        Self {
            batch_size: 6,
            batch_delay: Duration::from_millis(500),
            max_batch_delay: Duration::from_secs(8),
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

pub struct MetarPoller {
    feed: Arc<dyn MetarFeed>,
    store: Arc<dyn UpsertStore<Metar>>,
    settings: MetarSettings,
}

impl MetarPoller {
    pub fn new(feed: Arc<dyn MetarFeed>, store: Arc<dyn UpsertStore<Metar>>) -> Self {
        Self::with_settings(feed, store, MetarSettings::default())
    }

    pub fn with_settings(
        feed: Arc<dyn MetarFeed>,
        store: Arc<dyn UpsertStore<Metar>>,
        settings: MetarSettings,
    ) -> Self {
        Self {
            feed,
            store,
            settings,
        }
    }

    /// Fetch one state, retrying rate-limited responses under the shared backoff.
    async fn fetch_with_retry(
        &self,
        state: &str,
        backoff: &Mutex<Backoff>,
    ) -> Result<Vec<MetarReport>, FeedError> {
        let mut attempt = 1;
        loop {
            match self.feed.fetch_region(state).await {
                Ok(reports) => {
                    backoff.lock().unwrap_or_else(|e| e.into_inner()).on_success();
                    return Ok(reports);
                }
                Err(FeedError::RateLimited { retry_after })
                    if attempt < self.settings.max_attempts =>
                {
                    let delay = {
                        let mut backoff = backoff.lock().unwrap_or_else(|e| e.into_inner());
                        backoff.on_failure();
                        backoff.jittered()
                    };
                    let delay = retry_after.map_or(delay, |after| after.max(delay));
                    debug!(
                        state,
                        attempt,
                        delay = fmt_duration(delay),
                        "METAR fetch rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Poller for MetarPoller {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            key: SOURCE_KEY,
            name: "METAR observations",
            interval_seconds: 300,
        }
    }

    #[instrument(skip_all, fields(source = SOURCE_KEY))]
    async fn execute(&self) -> Result<PollOutcome> {
        let start = Instant::now();
        let retry_backoff = Mutex::new(Backoff::new(
            self.settings.retry_delay,
            self.settings.max_retry_delay,
        ));
        let mut batch_delay = Backoff::new(self.settings.batch_delay, self.settings.max_batch_delay);

        let mut reports = Vec::new();
        let mut failed_regions = 0usize;
        let mut last_error = None;

        for (index, batch) in US_STATES.chunks(self.settings.batch_size.max(1)).enumerate() {
            if index > 0 {
                batch_delay.sleep().await;
            }

            let results = join_all(
                batch
                    .iter()
                    .map(|state| self.fetch_with_retry(state, &retry_backoff)),
            )
            .await;

            let mut batch_failed = false;
            for (state, result) in batch.iter().zip(results) {
                match result {
                    Ok(batch_reports) => reports.extend(batch_reports),
                    Err(e) => {
                        warn!(state, error = %e, "Failed to fetch METARs for region");
                        failed_regions += 1;
                        batch_failed = true;
                        last_error = Some(format!("@{state}: {e}"));
                    }
                }
            }

            if batch_failed {
                batch_delay.on_failure();
            } else {
                batch_delay.on_success();
            }
        }

        if failed_regions == US_STATES.len() {
            bail!(
                "all {failed_regions} regional METAR fetches failed; last error: {}",
                last_error.unwrap_or_default()
            );
        }

        let metars = latest_per_station(reports);
        let written = self
            .store
            .upsert(&metars)
            .await
            .context("failed to upsert METARs")?;

        info!(
            stations = written,
            failed_regions,
            duration = fmt_duration(start.elapsed()),
            "METARs updated"
        );

        Ok(PollOutcome {
            records_updated: i32::try_from(written).unwrap_or(i32::MAX),
            errors: i32::try_from(failed_regions).unwrap_or(i32::MAX),
            last_error,
        })
    }
}

/// Postgres `metars` table: upsert by station plus age-based retention.
#[derive(Debug, Clone)]
pub struct PgMetarStore {
    pool: PgPool,
    retention: Duration,
}

impl PgMetarStore {
    pub fn new(pool: PgPool, retention: Duration) -> Self {
        Self { pool, retention }
    }
}

#[async_trait]
impl UpsertStore<Metar> for PgMetarStore {
    async fn upsert(&self, rows: &[Metar]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let icao_ids: Vec<&str> = rows.iter().map(|m| m.icao_id.as_str()).collect();
        let latitudes: Vec<Option<f64>> = rows.iter().map(|m| m.latitude).collect();
        let longitudes: Vec<Option<f64>> = rows.iter().map(|m| m.longitude).collect();
        let raw_obs: Vec<Option<&str>> = rows.iter().map(|m| m.raw_ob.as_deref()).collect();
        let categories: Vec<Option<&str>> =
            rows.iter().map(|m| m.flight_category.as_deref()).collect();
        let temps: Vec<Option<f64>> = rows.iter().map(|m| m.temp).collect();
        let dewps: Vec<Option<f64>> = rows.iter().map(|m| m.dewp).collect();
        let wdirs: Vec<Option<i32>> = rows.iter().map(|m| m.wdir).collect();
        let wspds: Vec<Option<i32>> = rows.iter().map(|m| m.wspd).collect();
        let wgsts: Vec<Option<i32>> = rows.iter().map(|m| m.wgst).collect();
        let visibs: Vec<Option<f64>> = rows.iter().map(|m| m.visib).collect();
        let altims: Vec<Option<f64>> = rows.iter().map(|m| m.altim).collect();
        let clouds: Vec<Value> = rows
            .iter()
            .map(|m| m.clouds.clone().unwrap_or(Value::Null))
            .collect();
        let obs_times: Vec<Option<i64>> = rows.iter().map(|m| m.obs_time).collect();
        let report_times: Vec<Option<&str>> =
            rows.iter().map(|m| m.report_time.as_deref()).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO metars (
                icao_id, latitude, longitude, raw_ob, flight_category, temp, dewp,
                wdir, wspd, wgst, visib, altim, clouds, obs_time, report_time, updated_at
            )
            SELECT v.icao_id, v.latitude, v.longitude, v.raw_ob, v.flight_category, v.temp, v.dewp,
                   v.wdir, v.wspd, v.wgst, v.visib, v.altim, NULLIF(v.clouds, 'null'::jsonb),
                   v.obs_time, v.report_time, NOW()
            FROM UNNEST(
                $1::text[], $2::float8[], $3::float8[], $4::text[], $5::text[], $6::float8[],
                $7::float8[], $8::int4[], $9::int4[], $10::int4[], $11::float8[], $12::float8[],
                $13::jsonb[], $14::int8[], $15::text[]
            ) AS v(icao_id, latitude, longitude, raw_ob, flight_category, temp, dewp,
                   wdir, wspd, wgst, visib, altim, clouds, obs_time, report_time)
            ON CONFLICT (icao_id)
            DO UPDATE SET
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                raw_ob = EXCLUDED.raw_ob,
                flight_category = EXCLUDED.flight_category,
                temp = EXCLUDED.temp,
                dewp = EXCLUDED.dewp,
                wdir = EXCLUDED.wdir,
                wspd = EXCLUDED.wspd,
                wgst = EXCLUDED.wgst,
                visib = EXCLUDED.visib,
                altim = EXCLUDED.altim,
                clouds = EXCLUDED.clouds,
                obs_time = EXCLUDED.obs_time,
                report_time = EXCLUDED.report_time,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&icao_ids)
        .bind(&latitudes)
        .bind(&longitudes)
        .bind(&raw_obs)
        .bind(&categories)
        .bind(&temps)
        .bind(&dewps)
        .bind(&wdirs)
        .bind(&wspds)
        .bind(&wgsts)
        .bind(&visibs)
        .bind(&altims)
        .bind(&clouds)
        .bind(&obs_times)
        .bind(&report_times)
        .execute(&self.pool)
        .await
        .context("failed to upsert METAR batch")?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Sweeper for PgMetarStore {
    fn name(&self) -> &'static str {
        "metars"
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now
            - chrono::Duration::from_std(self.retention)
                .context("METAR retention out of range")?;
        let result = sqlx::query("DELETE FROM metars WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to delete stale METARs")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pollers::store::MemoryUpsertStore;
    use std::collections::{HashSet, VecDeque};

    enum Reply {
        Reports(Vec<MetarReport>),
        RateLimited,
        Down,
    }

    /// Every state answers with one report for `K<state>` unless scripted otherwise.
    #[derive(Default)]
    struct ScriptedFeed {
        script: Mutex<HashMap<String, VecDeque<Reply>>>,
        down: HashSet<String>,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedFeed {
        fn down(states: &[&str]) -> Self {
            Self {
                down: states.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn script(self, state: &str, replies: Vec<Reply>) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(state.to_owned(), replies.into());
            self
        }

        fn calls(&self, state: &str) -> u32 {
            self.calls.lock().unwrap().get(state).copied().unwrap_or(0)
        }
    }

    fn report(id: &str, obs_time: i64, temp: f64) -> MetarReport {
        MetarReport {
            icao_id: Some(id.to_owned()),
            obs_time: Some(obs_time),
            temp: Some(temp),
            ..MetarReport::default()
        }
    }

    #[async_trait]
    impl MetarFeed for ScriptedFeed {
        async fn fetch_region(&self, state: &str) -> Result<Vec<MetarReport>, FeedError> {
            *self.calls.lock().unwrap().entry(state.to_owned()).or_default() += 1;
            let scripted = self
                .script
                .lock()
                .unwrap()
                .get_mut(state)
                .and_then(VecDeque::pop_front);
            let reply = match scripted {
                Some(reply) => reply,
                None if self.down.contains(state) => Reply::Down,
                None => Reply::Reports(vec![report(&format!("K{state}"), 100, 10.0)]),
            };
            match reply {
                Reply::Reports(reports) => Ok(reports),
                Reply::RateLimited => Err(FeedError::RateLimited { retry_after: None }),
                Reply::Down => Err(FeedError::Status {
                    status: 503,
                    url: format!("https://awc.test/metar?ids=@{state}"),
                }),
            }
        }
    }

    fn poller(feed: ScriptedFeed) -> (MetarPoller, Arc<MemoryUpsertStore<Metar>>) {
        let store = Arc::new(MemoryUpsertStore::new());
        (MetarPoller::new(Arc::new(feed), store.clone()), store)
    }

    #[test]
    fn keeps_newest_report_per_station() {
        let metars = latest_per_station(vec![
            report("KAUS", 100, 10.0),
            report("KAUS", 300, 12.0),
            report("KAUS", 200, 11.0),
            MetarReport::default(),
        ]);
        assert_eq!(metars.len(), 1);
        assert_eq!(metars[0].obs_time, Some(300));
        assert_eq!(metars[0].temp, Some(12.0));
    }

    #[test]
    fn variable_wind_and_string_visibility_become_null() {
        let reports: Vec<MetarReport> = crate::pollers::json::decode_json(
            r#"[{"icaoId":"KAUS","wdir":"VRB","visib":"10+","obsTime":1}]"#,
        )
        .unwrap();
        let metar = &latest_per_station(reports)[0];
        assert_eq!(metar.wdir, None);
        assert_eq!(metar.visib, None);
    }

    #[tokio::test(start_paused = true)]
    async fn one_region_failing_does_not_fail_the_run() {
        let (poller, store) = poller(ScriptedFeed::down(&["TX"]));
        let outcome = poller.execute().await.unwrap();

        assert_eq!(outcome.records_updated, 49);
        assert_eq!(outcome.errors, 1);
        assert!(outcome.last_error.unwrap().contains("@TX"));
        assert!(store.get(&"KTX".to_owned()).is_none());
        assert!(store.get(&"KCA".to_owned()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn every_region_failing_fails_the_run() {
        let (poller, store) = poller(ScriptedFeed::down(&US_STATES));
        let err = poller.execute().await.unwrap_err();
        assert!(err.to_string().contains("all 50 regional METAR fetches failed"));
        assert!(store.rows().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_region_is_retried() {
        let feed = ScriptedFeed::default().script("CO", vec![Reply::RateLimited, Reply::RateLimited]);
        let feed = Arc::new(feed);
        let store = Arc::new(MemoryUpsertStore::new());
        let poller = MetarPoller::new(feed.clone(), store.clone());

        let outcome = poller.execute().await.unwrap();
        assert_eq!(outcome.errors, 0);
        assert_eq!(feed.calls("CO"), 3);
        assert!(store.get(&"KCO".to_owned()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_gives_up_after_max_attempts() {
        let feed = ScriptedFeed::default().script(
            "CO",
            vec![Reply::RateLimited, Reply::RateLimited, Reply::RateLimited],
        );
        let feed = Arc::new(feed);
        let poller = MetarPoller::new(feed.clone(), Arc::new(MemoryUpsertStore::new()));

        let outcome = poller.execute().await.unwrap();
        assert_eq!(outcome.errors, 1);
        assert_eq!(feed.calls("CO"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn running_twice_does_not_duplicate_rows() {
        let (poller, store) = poller(ScriptedFeed::default());
        poller.execute().await.unwrap();
        let first = store.rows().len();
        poller.execute().await.unwrap();
        assert_eq!(first, 50);
        assert_eq!(store.rows().len(), first);
    }
}
