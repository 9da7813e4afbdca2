//! Xweather storm cells over CONUS, stored as a full snapshot.

use crate::data::models::SourceDescriptor;
use crate::pollers::http::{FeedClient, FeedError};
use crate::pollers::store::SnapshotStore;
use crate::pollers::{PollOutcome, Poller};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const SOURCE_KEY: &str = "storm_cell_poll";

/// `lat,lon,lat,lon` box covering the contiguous US.
pub const CONUS_BOUNDS: &str = "24,-125,50,-66";

const MAX_CELLS: &str = "500";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StormCellResponse {
    pub success: bool,
    pub error: Option<XweatherError>,
    pub response: Option<Vec<StormCellReport>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct XweatherError {
    pub code: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Loc {
    pub lat: Option<f64>,
    pub long: Option<f64>,
}

impl Loc {
    fn lon_lat(&self) -> Option<[f64; 2]> {
        Some([self.long?, self.lat?])
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForecastPoint {
    pub loc: Option<Loc>,
    pub error_cone: Vec<Loc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StormCellReport {
    pub id: Option<String>,
    pub loc: Option<Loc>,
    pub traits: Vec<String>,
    pub forecast: Vec<ForecastPoint>,
    pub movement: Option<Value>,
    pub hail: Option<Value>,
    pub tvs: Option<Value>,
    pub mda: Option<Value>,
    pub dbzm: Option<Value>,
}

/// The most severe trait reported for a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StormTrait {
    Tornado,
    Rotating,
    Hail,
    General,
}

impl StormTrait {
    pub fn from_traits(traits: &[String]) -> Self {
        let has = |name: &str| traits.iter().any(|t| t == name);
        if has("tornado") {
            Self::Tornado
        } else if has("rotating") {
            Self::Rotating
        } else if has("hail") {
            Self::Hail
        } else {
            Self::General
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tornado => "tornado",
            Self::Rotating => "rotating",
            Self::Hail => "hail",
            Self::General => "general",
        }
    }
}

/// A row of the `storm_cells` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StormCell {
    pub cell_id: String,
    pub primary_trait: StormTrait,
    pub latitude: f64,
    pub longitude: f64,
    /// GeoJSON Point.
    pub geometry: Value,
    /// GeoJSON LineString from the current position through the forecast.
    pub forecast_track: Option<Value>,
    /// GeoJSON Polygon built from the forecast error cones, closed.
    pub forecast_cone: Option<Value>,
    pub properties: Value,
    pub poll_batch_id: String,
}

impl StormCell {
    /// Build a row from a report. Reports without a position are skipped.
    pub fn from_report(report: StormCellReport, batch_id: &str) -> Option<Self> {
        let loc = report.loc?;
        let origin = loc.lon_lat()?;
        let [longitude, latitude] = origin;

        let mut track = vec![origin];
        track.extend(
            report
                .forecast
                .iter()
                .filter_map(|f| f.loc.as_ref().and_then(Loc::lon_lat)),
        );
        let forecast_track = (track.len() >= 2).then(|| {
            json!({ "type": "LineString", "coordinates": track })
        });

        let mut cone: Vec<[f64; 2]> = report
            .forecast
            .iter()
            .flat_map(|f| f.error_cone.iter().filter_map(Loc::lon_lat))
            .collect();
        let forecast_cone = (cone.len() >= 3).then(|| {
            cone.push(cone[0]);
            json!({ "type": "Polygon", "coordinates": [cone] })
        });

        let primary_trait = StormTrait::from_traits(&report.traits);
        let properties = json!({
            "movement": report.movement,
            "hail": report.hail,
            "tvs": report.tvs,
            "mda": report.mda,
            "dbzm": report.dbzm,
            "traits": report.traits,
        });

        Some(Self {
            cell_id: report
                .id
                .unwrap_or_else(|| format!("{latitude}_{longitude}")),
            primary_trait,
            latitude,
            longitude,
            geometry: json!({ "type": "Point", "coordinates": origin }),
            forecast_track,
            forecast_cone,
            properties,
            poll_batch_id: batch_id.to_owned(),
        })
    }
}

#[async_trait]
pub trait StormCellFeed: Send + Sync {
    async fn fetch_cells(&self) -> Result<Vec<StormCellReport>, FeedError>;
}

#[derive(Debug, Clone)]
pub struct XweatherCredentials {
    pub client_id: String,
    pub client_secret: String,
}

pub struct XweatherStormFeed {
    client: FeedClient,
    base_url: String,
    credentials: Option<XweatherCredentials>,
}

impl XweatherStormFeed {
    pub fn new(
        client: FeedClient,
        base_url: impl Into<String>,
        credentials: Option<XweatherCredentials>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            credentials,
        }
    }
}

#[async_trait]
impl StormCellFeed for XweatherStormFeed {
    async fn fetch_cells(&self) -> Result<Vec<StormCellReport>, FeedError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(FeedError::MissingCredentials("Xweather"))?;

        let url = format!("{}/stormcells", self.base_url);
        let response: StormCellResponse = self
            .client
            .get_json(
                &url,
                &[
                    ("action", "within"),
                    ("p", CONUS_BOUNDS),
                    ("limit", MAX_CELLS),
                    ("client_id", credentials.client_id.as_str()),
                    ("client_secret", credentials.client_secret.as_str()),
                ],
            )
            .await?;

        if !response.success {
            let reason = response
                .error
                .map(|e| format!("{}: {}", e.code, e.description))
                .unwrap_or_else(|| "unsuccessful response".to_owned());
            return Err(FeedError::Upstream(reason));
        }
        // A successful response with no cells omits `response`.
        Ok(response.response.unwrap_or_default())
    }
}

pub struct StormCellPoller {
    feed: Arc<dyn StormCellFeed>,
    store: Arc<dyn SnapshotStore<StormCell>>,
}

impl StormCellPoller {
    pub fn new(feed: Arc<dyn StormCellFeed>, store: Arc<dyn SnapshotStore<StormCell>>) -> Self {
        Self { feed, store }
    }
}

#[async_trait]
impl Poller for StormCellPoller {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            key: SOURCE_KEY,
            name: "Storm cells",
            interval_seconds: 180,
        }
    }

    #[instrument(skip_all, fields(source = SOURCE_KEY))]
    async fn execute(&self) -> Result<PollOutcome> {
        let reports = match self.feed.fetch_cells().await {
            Ok(reports) => reports,
            Err(e @ FeedError::MissingCredentials(_)) => {
                warn!(error = %e, "Storm cell feed not configured");
                return Ok(PollOutcome {
                    records_updated: 0,
                    errors: 1,
                    last_error: Some(e.to_string()),
                });
            }
            Err(e) => return Err(e).context("failed to fetch storm cells"),
        };

        let batch_id = format!("batch-{}", Utc::now().timestamp_millis());
        let received = reports.len();
        let cells: Vec<StormCell> = reports
            .into_iter()
            .filter_map(|r| StormCell::from_report(r, &batch_id))
            .collect();

        let written = self
            .store
            .replace_all(&cells)
            .await
            .context("failed to replace storm cells")?;

        info!(
            received,
            saved = written,
            batch_id = batch_id.as_str(),
            "Storm cells replaced"
        );
        Ok(PollOutcome::updated(cells.len()))
    }
}

/// Postgres `storm_cells` table, replaced wholesale each run.
#[derive(Debug, Clone)]
pub struct PgStormCellStore {
    pool: PgPool,
}

impl PgStormCellStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore<StormCell> for PgStormCellStore {
    async fn replace_all(&self, rows: &[StormCell]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM storm_cells")
            .execute(&mut *tx)
            .await
            .context("failed to clear storm cells")?;

        if !rows.is_empty() {
            let cell_ids: Vec<&str> = rows.iter().map(|c| c.cell_id.as_str()).collect();
            let traits: Vec<&str> = rows.iter().map(|c| c.primary_trait.as_str()).collect();
            let latitudes: Vec<f64> = rows.iter().map(|c| c.latitude).collect();
            let longitudes: Vec<f64> = rows.iter().map(|c| c.longitude).collect();
            let geometries: Vec<Value> = rows.iter().map(|c| c.geometry.clone()).collect();
            let tracks: Vec<Value> = rows
                .iter()
                .map(|c| c.forecast_track.clone().unwrap_or(Value::Null))
                .collect();
            let cones: Vec<Value> = rows
                .iter()
                .map(|c| c.forecast_cone.clone().unwrap_or(Value::Null))
                .collect();
            let properties: Vec<Value> = rows.iter().map(|c| c.properties.clone()).collect();
            let batch_ids: Vec<&str> = rows.iter().map(|c| c.poll_batch_id.as_str()).collect();

            sqlx::query(
                r#"
                INSERT INTO storm_cells (
                    cell_id, primary_trait, latitude, longitude, geometry,
                    forecast_track, forecast_cone, properties, poll_batch_id
                )
                SELECT v.cell_id, v.primary_trait, v.latitude, v.longitude, v.geometry,
                       NULLIF(v.forecast_track, 'null'::jsonb),
                       NULLIF(v.forecast_cone, 'null'::jsonb),
                       v.properties, v.poll_batch_id
                FROM UNNEST(
                    $1::text[], $2::text[], $3::float8[], $4::float8[], $5::jsonb[],
                    $6::jsonb[], $7::jsonb[], $8::jsonb[], $9::text[]
                ) AS v(cell_id, primary_trait, latitude, longitude, geometry,
                       forecast_track, forecast_cone, properties, poll_batch_id)
                "#,
            )
            .bind(&cell_ids)
            .bind(&traits)
            .bind(&latitudes)
            .bind(&longitudes)
            .bind(&geometries)
            .bind(&tracks)
            .bind(&cones)
            .bind(&properties)
            .bind(&batch_ids)
            .execute(&mut *tx)
            .await
            .context("failed to insert storm cells")?;
        }

        tx.commit().await.context("failed to commit storm cell snapshot")?;
        Ok(rows.len() as u64)
    }
}
