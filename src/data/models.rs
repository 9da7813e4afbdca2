//! Row types shared by the source registry, run log and data cycle tables.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of a pollable source.
///
/// Transitions are always conditional on the previous value:
/// `idle|failed -> queued` (scheduler), `queued|failed|idle -> running` and
/// `running -> idle|failed` (worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "source_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Idle,
    Queued,
    Running,
    Failed,
}

impl SourceStatus {
    pub const ALL: [SourceStatus; 4] = [Self::Idle, Self::Queued, Self::Running, Self::Failed];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }

    /// Whether the scheduler may move a source in this state to `queued`.
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Idle | Self::Failed)
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state and configuration for one external feed.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Source {
    pub key: String,
    pub name: String,
    pub interval_seconds: i32,
    pub enabled: bool,
    pub status: SourceStatus,
    pub last_requested_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<i32>,
    pub records_updated: Option<i32>,
    pub last_error_count: Option<i32>,
    pub last_error: Option<String>,
}

impl Source {
    /// Returns true once at least `interval_seconds` have passed since the
    /// source was last requested. A source that was never requested is due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_requested_at {
            None => true,
            Some(requested) => {
                (now - requested).num_seconds() >= i64::from(self.interval_seconds)
            }
        }
    }

    /// Queue expiration for a job of this source: twice the interval, capped at a day.
    pub fn expire_in_seconds(&self) -> u32 {
        let doubled = u32::try_from(self.interval_seconds.max(1)).unwrap_or(u32::MAX);
        doubled.saturating_mul(2).min(MAX_JOB_EXPIRY_SECS)
    }
}

/// Upper bound on how long a job may run before it is reported as stuck.
pub const MAX_JOB_EXPIRY_SECS: u32 = 24 * 60 * 60;

/// Static description of a source, provided by its poller and used for seeding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub key: &'static str,
    pub name: &'static str,
    pub interval_seconds: i32,
}

/// Stats written when a poll finishes without throwing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionStats {
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i32,
    pub records_updated: i32,
    pub error_count: i32,
}

/// Outcome of one poller execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "run_outcome", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Partial,
    Failed,
}

/// Append-only audit entry, one per execution.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RunRecord {
    pub id: i64,
    pub source_key: String,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i32,
    pub records_updated: i32,
    pub error_count: i32,
    pub error_message: Option<String>,
}

/// A run record before it has been assigned an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRunRecord {
    pub source_key: String,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i32,
    pub records_updated: i32,
    pub error_count: i32,
    pub error_message: Option<String>,
}

/// Per-status counts for the operator summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub total: i64,
    pub enabled: i64,
    pub disabled: i64,
    pub idle: i64,
    pub queued: i64,
    pub running: i64,
    pub failed: i64,
}

impl SourceSummary {
    pub fn from_sources(sources: &[Source]) -> Self {
        let mut summary = Self::default();
        for source in sources {
            summary.total += 1;
            if source.enabled {
                summary.enabled += 1;
            } else {
                summary.disabled += 1;
            }
            match source.status {
                SourceStatus::Idle => summary.idle += 1,
                SourceStatus::Queued => summary.queued += 1,
                SourceStatus::Running => summary.running += 1,
                SourceStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

/// A family of bulk reference datasets that are versioned together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "data_group", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DataGroup {
    Nasr,
    Cifp,
    Dtpp,
    Charts,
}

impl DataGroup {
    pub const ALL: [DataGroup; 4] = [Self::Nasr, Self::Cifp, Self::Dtpp, Self::Charts];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nasr => "nasr",
            Self::Cifp => "cifp",
            Self::Dtpp => "dtpp",
            Self::Charts => "charts",
        }
    }

    /// Tables whose rows carry a `cycle_id` for this group, children first.
    pub fn tables(self) -> &'static [&'static str] {
        match self {
            Self::Nasr => &[
                "a_runway_ends",
                "a_runways",
                "a_frequencies",
                "a_airports",
                "a_navaids",
                "a_fixes",
                "a_airspaces",
                "a_airway_segments",
                "a_artcc_boundaries",
                "a_preferred_route_segments",
                "a_preferred_routes",
            ],
            Self::Cifp => &[
                "a_cifp_legs",
                "a_cifp_approaches",
                "a_cifp_ils",
                "a_cifp_msa",
                "a_cifp_runways",
            ],
            Self::Dtpp => &["a_procedures", "a_dtpp_cycles"],
            // Chart files live on disk.
            Self::Charts => &[],
        }
    }
}

impl fmt::Display for DataGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataGroup {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown data group: {s}"))
    }
}

/// Lifecycle state of a data cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "cycle_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Rows are still being imported.
    Seeding,
    /// Fully imported, invisible to normal reads.
    Staged,
    Active,
    /// Previously active; can be re-activated by a rollback.
    RolledBack,
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Seeding => "seeding",
            Self::Staged => "staged",
            Self::Active => "active",
            Self::RolledBack => "rolled_back",
        })
    }
}

/// A versioned snapshot of bulk reference data for one data group.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DataCycle {
    pub id: Uuid,
    pub data_group: DataGroup,
    pub cycle_code: String,
    pub effective_date: NaiveDate,
    pub expiration_date: NaiveDate,
    pub status: CycleStatus,
    pub source_url: Option<String>,
    pub record_counts: sqlx::types::Json<BTreeMap<String, i64>>,
    pub seeded_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// Input for creating a cycle in `seeding` status.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewDataCycle {
    pub data_group: DataGroup,
    pub cycle_code: String,
    pub effective_date: NaiveDate,
    pub expiration_date: NaiveDate,
    pub source_url: Option<String>,
}
