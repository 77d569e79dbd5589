//! Core domain model for the search-query performance sync engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sqp-core";

pub const DEFAULT_SCHEMA: &str = "public";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid table identifier `{0}`")]
    TableId(String),
    #[error("unknown {kind} `{value}`")]
    Unknown { kind: &'static str, value: String },
}

/// True for plain SQL identifiers (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_plain_identifier(input: &str) -> bool {
    let mut chars = input.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Schema-qualified table identity. Ordering follows the `schema.table` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl FromStr for TableId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (schema, table) = match s.split_once('.') {
            Some((schema, table)) => (schema, table),
            None => (DEFAULT_SCHEMA, s),
        };
        if !is_plain_identifier(schema) || !is_plain_identifier(table) {
            return Err(ParseError::TableId(s.to_string()));
        }
        Ok(Self::new(schema, table))
    }
}

// ---------------------------------------------------------------------------
// Refresh schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    #[default]
    Hard,
    Soft,
}

impl DependencyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
        }
    }
}

impl FromStr for DependencyKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hard" => Ok(Self::Hard),
            "soft" => Ok(Self::Soft),
            other => Err(ParseError::Unknown {
                kind: "dependency kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Edge `parent -> dependent`: the dependent refreshes after the parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefreshDependency {
    pub parent: TableId,
    pub dependent: TableId,
    pub kind: DependencyKind,
}

/// Values used to create or replace a refresh config row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRefreshConfig {
    pub table: TableId,
    pub enabled: bool,
    pub frequency_hours: i64,
    pub priority: i32,
    #[serde(default)]
    pub custom_parameters: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub id: i64,
    pub table: TableId,
    pub enabled: bool,
    pub frequency_hours: i64,
    pub priority: i32,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub next_refresh_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub custom_parameters: JsonValue,
}

/// Longest accepted refresh interval, one hundred years.
pub const MAX_FREQUENCY_HOURS: i64 = 100 * 365 * 24;

impl RefreshConfig {
    /// Refresh interval, clamped to `[0, MAX_FREQUENCY_HOURS]`.
    pub fn frequency(&self) -> Duration {
        Duration::try_hours(self.frequency_hours.clamp(0, MAX_FREQUENCY_HOURS))
            .unwrap_or_else(Duration::zero)
    }

    /// `at + frequency`, saturating at the latest representable instant.
    pub fn after_interval(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at.checked_add_signed(self.frequency())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// When the table next becomes due. `None` means it has never refreshed
    /// and is due immediately.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.next_refresh_at
            .or_else(|| self.last_refresh_at.map(|last| self.after_interval(last)))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.due_at().map_or(true, |due| due <= now)
    }

    pub fn hours_since_refresh(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_refresh_at
            .map(|last| (now - last).num_seconds().max(0) as f64 / 3600.0)
    }

    pub fn staleness(&self, now: DateTime<Utc>) -> f64 {
        match self.hours_since_refresh(now) {
            Some(hours) => staleness_score(hours, self.frequency_hours as f64),
            None => 0.0,
        }
    }
}

/// Freshness in `[0, 100]`: 100 right after a refresh, 0 once a full
/// frequency interval has elapsed.
pub fn staleness_score(hours_since_refresh: f64, frequency_hours: f64) -> f64 {
    if frequency_hours <= 0.0 {
        return if hours_since_refresh <= 0.0 { 100.0 } else { 0.0 };
    }
    (100.0 - 100.0 * hours_since_refresh / frequency_hours).clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// Run audit log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    PartialSuccess,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess | Self::Failed)
    }

    /// Whether a run with this status advances the table's schedule.
    pub fn advances_schedule(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "partial_success" => Ok(Self::PartialSuccess),
            "failed" => Ok(Self::Failed),
            other => Err(ParseError::Unknown {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub table: TableId,
    pub cycle_id: Option<Uuid>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rows_processed: i64,
    pub duration_ms: Option<i64>,
    pub warnings: i64,
    pub error_message: Option<String>,
}

/// The single completion update applied to a running [`SyncRun`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub rows_processed: i64,
    pub warnings: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for PipelineStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseError::Unknown {
                kind: "pipeline status",
                value: other.to_string(),
            }),
        }
    }
}

/// Resume point of a named incremental pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionState {
    pub pipeline_id: String,
    pub last_watermark: Option<DateTime<Utc>>,
    pub status: PipelineStatus,
    pub rows_processed: i64,
    pub updated_at: DateTime<Utc>,
}

impl ExtractionState {
    pub fn new(pipeline_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            last_watermark: None,
            status: PipelineStatus::Idle,
            rows_processed: 0,
            updated_at: now,
        }
    }

    /// Record a committed batch. The watermark never moves backwards.
    pub fn advance(&mut self, watermark: Option<DateTime<Utc>>, rows: usize, now: DateTime<Utc>) {
        self.last_watermark = max_watermark(self.last_watermark, watermark);
        self.rows_processed += rows as i64;
        self.updated_at = now;
    }
}

pub fn max_watermark(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Warehouse,
    Store,
    Validation,
    Sync,
    Network,
    DataQuality,
    Configuration,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        Self::Warehouse,
        Self::Store,
        Self::Validation,
        Self::Sync,
        Self::Network,
        Self::DataQuality,
        Self::Configuration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warehouse => "warehouse",
            Self::Store => "store",
            Self::Validation => "validation",
            Self::Sync => "sync",
            Self::Network => "network",
            Self::DataQuality => "data_quality",
            Self::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub context: JsonValue,
    pub retryable: bool,
    pub retry_count: u32,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

// ---------------------------------------------------------------------------
// Warehouse rows and extraction filters
// ---------------------------------------------------------------------------

/// One search-query snapshot row as delivered by the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub entity_id: String,
    #[serde(default)]
    pub entity_name: Option<String>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub detail_key: String,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub metrics: BTreeMap<String, JsonValue>,
}

impl SourceRow {
    pub fn parent_key(&self) -> ParentKey {
        ParentKey {
            entity_id: self.entity_id.trim().to_string(),
            period_start: self.period_start,
            period_end: self.period_end,
        }
    }
}

/// Temporal columns usable as an incremental cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalColumn {
    #[default]
    ObservedAt,
    PeriodStart,
    PeriodEnd,
}

impl TemporalColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ObservedAt => "observed_at",
            Self::PeriodStart => "period_start",
            Self::PeriodEnd => "period_end",
        }
    }

    pub fn value_of(self, row: &SourceRow) -> DateTime<Utc> {
        match self {
            Self::ObservedAt => row.observed_at,
            Self::PeriodStart => start_of_day(row.period_start),
            Self::PeriodEnd => start_of_day(row.period_end),
        }
    }
}

pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Lower bound on a temporal column (`column >= value`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub column: TemporalColumn,
    pub value: DateTime<Utc>,
}

/// Filter descriptor shared by every extraction entry point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractFilter {
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub entity_ids: Vec<String>,
    #[serde(default)]
    pub min_metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub since: Option<Watermark>,
    #[serde(default)]
    pub order_by: TemporalColumn,
}

impl ExtractFilter {
    pub fn with_since(mut self, column: TemporalColumn, value: Option<DateTime<Utc>>) -> Self {
        self.since = value.map(|value| Watermark { column, value });
        self.order_by = column;
        self
    }

    pub fn matches(&self, row: &SourceRow) -> bool {
        if let Some(range) = &self.date_range {
            if row.period_start < range.start || row.period_end > range.end {
                return false;
            }
        }
        if !self.entity_ids.is_empty() && !self.entity_ids.iter().any(|id| id == &row.entity_id) {
            return false;
        }
        for (metric, min) in &self.min_metrics {
            let value = row.metrics.get(metric).and_then(parse_rate).unwrap_or(0.0);
            if value < *min {
                return false;
            }
        }
        if let Some(since) = &self.since {
            if since.column.value_of(row) < since.value {
                return false;
            }
        }
        true
    }
}

/// Stable `(temporal, identity)` ordering key for deterministic extraction.
pub fn row_order_key(
    row: &SourceRow,
    column: TemporalColumn,
) -> (DateTime<Utc>, &str, NaiveDate, NaiveDate, &str) {
    (
        column.value_of(row),
        row.entity_id.as_str(),
        row.period_start,
        row.period_end,
        row.detail_key.as_str(),
    )
}

pub fn sort_rows(rows: &mut [SourceRow], column: TemporalColumn) {
    rows.sort_by(|a, b| row_order_key(a, column).cmp(&row_order_key(b, column)));
}

// ---------------------------------------------------------------------------
// Destination records
// ---------------------------------------------------------------------------

/// Natural key of a search-query report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParentKey {
    pub entity_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

impl ParentKey {
    pub fn is_valid(&self) -> bool {
        !self.entity_id.is_empty() && self.period_end >= self.period_start
    }
}

impl fmt::Display for ParentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{}]", self.entity_id, self.period_start, self.period_end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRecord {
    pub id: i64,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParentRecord {
    pub fn key(&self) -> ParentKey {
        ParentKey {
            entity_id: self.entity_id.clone(),
            period_start: self.period_start,
            period_end: self.period_end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub id: i64,
    pub parent_id: i64,
    pub detail_key: String,
    pub metrics: QueryMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parent row ready for upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentUpsert {
    pub key: ParentKey,
    pub entity_name: Option<String>,
}

/// Child row with its parent already resolved to a surrogate id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildUpsert {
    pub parent_id: i64,
    pub detail_key: String,
    pub metrics: QueryMetrics,
}

/// Physical parent/child tables a load writes into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationTarget {
    pub schema: String,
    pub parent_table: String,
    pub child_table: String,
}

impl Default for DestinationTarget {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            parent_table: "search_query_reports".to_string(),
            child_table: "search_query_metrics".to_string(),
        }
    }
}

impl DestinationTarget {
    pub fn is_valid(&self) -> bool {
        is_plain_identifier(&self.schema)
            && is_plain_identifier(&self.parent_table)
            && is_plain_identifier(&self.child_table)
    }
}

// ---------------------------------------------------------------------------
// Metrics and numeric coercion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub impressions: i64,
    pub clicks: i64,
    pub conversions: i64,
    pub cost: f64,
    pub ctr: f64,
    pub conversion_rate: f64,
    pub cost_per_conversion: f64,
}

impl QueryMetrics {
    pub const COUNT_FIELDS: [&'static str; 3] = ["impressions", "clicks", "conversions"];
    pub const RATE_FIELDS: [&'static str; 4] =
        ["cost", "ctr", "conversion_rate", "cost_per_conversion"];

    /// Coerce loosely typed warehouse metrics. Returns the metrics and the
    /// number of fields that fell back to zero.
    pub fn from_raw(raw: &BTreeMap<String, JsonValue>) -> (Self, usize) {
        let mut defaulted = 0usize;
        let mut count = |name: &str| match raw.get(name).and_then(parse_count) {
            Some(v) => v,
            None => {
                defaulted += 1;
                0
            }
        };
        let impressions = count("impressions");
        let clicks = count("clicks");
        let conversions = count("conversions");

        let mut rate = |name: &str| match raw.get(name).and_then(parse_rate) {
            Some(v) => v,
            None => {
                defaulted += 1;
                0.0
            }
        };
        let metrics = Self {
            impressions,
            clicks,
            conversions,
            cost: rate("cost"),
            ctr: rate("ctr"),
            conversion_rate: rate("conversion_rate"),
            cost_per_conversion: rate("cost_per_conversion"),
        };
        (metrics, defaulted)
    }
}

/// Integer count from a JSON number or numeric string. Fractions truncate.
pub fn parse_count(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            })
        }
        _ => None,
    }
}

/// Finite float from a JSON number or numeric string.
pub fn parse_rate(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}
