//! Error classification, storage, threshold alerting and retries.
//!
//! Classification is driven by three ordered rule tables evaluated top to
//! bottom over the lower-cased error text. The first matching rule wins.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sqp_core::{ErrorCategory, ErrorDetail, Severity};
use sqp_storage::BackoffPolicy;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

pub struct ClassificationRule<T> {
    pub patterns: &'static [&'static str],
    pub value: T,
}

const fn rule<T>(patterns: &'static [&'static str], value: T) -> ClassificationRule<T> {
    ClassificationRule { patterns, value }
}

pub const CATEGORY_RULES: &[ClassificationRule<ErrorCategory>] = &[
    rule(
        &[
            "cyclic dependency",
            "dependency cycle",
            "unknown table",
            "missing setting",
            "not configured",
            "configuration",
            "environment variable",
        ],
        ErrorCategory::Configuration,
    ),
    rule(
        &[
            "etimedout",
            "timed out",
            "timeout",
            "econnreset",
            "econnrefused",
            "connection reset",
            "connection refused",
            "connection closed",
            "broken pipe",
            "dns",
            "network",
            "socket",
        ],
        ErrorCategory::Network,
    ),
    rule(
        &["warehouse", "bigquery", "query job", "export job"],
        ErrorCategory::Warehouse,
    ),
    rule(
        &[
            "relation",
            "postgres",
            "database",
            "sqlx",
            "constraint",
            "deadlock",
            "foreign key",
            "duplicate key",
        ],
        ErrorCategory::Store,
    ),
    rule(
        &[
            "invalid",
            "malformed",
            "missing field",
            "missing required",
            "failed to parse",
            "expected",
        ],
        ErrorCategory::Validation,
    ),
    rule(
        &[
            "unresolved",
            "duplicate",
            "anomaly",
            "incomplete",
            "data quality",
        ],
        ErrorCategory::DataQuality,
    ),
    rule(
        &["sync", "mismatch", "parent lookup"],
        ErrorCategory::Sync,
    ),
];

pub const SEVERITY_RULES: &[ClassificationRule<Severity>] = &[
    rule(
        &[
            "permission",
            "authentication",
            "unauthorized",
            "forbidden",
            "access denied",
            "credentials",
        ],
        Severity::Critical,
    ),
    rule(
        &["quota", "rate limit", "rate-limit", "too many requests"],
        Severity::High,
    ),
];

/// `false` entries come first: a permanent failure is never retried even if
/// its text also mentions a transient condition.
pub const RETRY_RULES: &[ClassificationRule<bool>] = &[
    rule(
        &[
            "permission",
            "authentication",
            "unauthorized",
            "forbidden",
            "invalid",
            "malformed",
        ],
        false,
    ),
    rule(
        &[
            "timeout",
            "timed out",
            "etimedout",
            "econnreset",
            "connection reset",
            "network",
            "temporary",
            "temporarily",
            "transient",
            "unavailable",
        ],
        true,
    ),
];

fn first_match<T: Copy>(rules: &[ClassificationRule<T>], text: &str) -> Option<T> {
    rules
        .iter()
        .find(|r| r.patterns.iter().any(|p| text.contains(p)))
        .map(|r| r.value)
}

pub fn default_severity(category: ErrorCategory) -> Severity {
    match category {
        ErrorCategory::Configuration => Severity::Critical,
        ErrorCategory::Warehouse | ErrorCategory::Store => Severity::High,
        ErrorCategory::Network | ErrorCategory::Validation | ErrorCategory::Sync => {
            Severity::Medium
        }
        ErrorCategory::DataQuality => Severity::Low,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retryable: bool,
}

pub fn classify(message: &str) -> Classification {
    let text = message.to_lowercase();
    let category = first_match(CATEGORY_RULES, &text).unwrap_or(ErrorCategory::Sync);
    let severity = first_match(SEVERITY_RULES, &text).unwrap_or_else(|| default_severity(category));
    let retryable = first_match(RETRY_RULES, &text).unwrap_or(false);
    Classification {
        category,
        severity,
        retryable,
    }
}

/// Input to [`ErrorTracker::track_error`]; id and timestamp are filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct NewError {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub context: JsonValue,
    pub retryable: bool,
}

impl NewError {
    pub fn new(category: ErrorCategory, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
            context: json!({}),
            retryable: false,
        }
    }

    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = context;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerMatch {
    MessageContains(String),
    Category(ErrorCategory),
}

impl HandlerMatch {
    fn matches(&self, error: &ErrorDetail) -> bool {
        match self {
            Self::MessageContains(needle) => error
                .message
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            Self::Category(category) => error.category == *category,
        }
    }
}

pub type ErrorHandler = Arc<dyn Fn(&ErrorDetail) + Send + Sync>;
pub type AlertCallback = Arc<dyn Fn(&[ThresholdBreach]) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorThreshold {
    pub category: ErrorCategory,
    pub min_severity: Severity,
    pub max_count: usize,
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdBreach {
    pub threshold: ErrorThreshold,
    pub count: usize,
}

/// Pure retry decision over an error record and the attempt about to be made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Attempt { attempt: u32, delay: Duration },
    NotRetryable,
    AlreadyResolved,
    Exhausted { attempts: u32 },
}

impl RetryPolicy {
    pub fn evaluate(&self, record: &ErrorDetail) -> RetryDecision {
        if record.resolved {
            return RetryDecision::AlreadyResolved;
        }
        if !record.retryable {
            return RetryDecision::NotRetryable;
        }
        if record.retry_count >= self.max_attempts {
            return RetryDecision::Exhausted {
                attempts: record.retry_count,
            };
        }
        RetryDecision::Attempt {
            attempt: record.retry_count + 1,
            delay: self.backoff.delay_for_attempt(record.retry_count as usize),
        }
    }

    /// New record reflecting the outcome of `attempt`.
    pub fn apply(
        &self,
        record: &ErrorDetail,
        attempt: u32,
        outcome: Result<(), String>,
        now: DateTime<Utc>,
    ) -> ErrorDetail {
        let mut next = record.clone();
        next.retry_count = attempt;
        match outcome {
            Ok(()) => {
                next.resolved = true;
                next.resolved_at = Some(now);
                next.resolution = Some(format!("resolved by retry attempt {attempt}"));
            }
            Err(reason) => {
                next.message = format!(
                    "{} (retry attempt {attempt} failed: {reason})",
                    base_message(&record.message)
                );
            }
        }
        next
    }
}

fn base_message(message: &str) -> &str {
    message
        .find(" (retry attempt ")
        .map_or(message, |idx| &message[..idx])
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("error {0} not found")]
    NotFound(Uuid),
    #[error("error {0} is not retryable")]
    NotRetryable(Uuid),
    #[error("error {0} is already resolved")]
    AlreadyResolved(Uuid),
    #[error("error {id} exhausted its {attempts} retry attempts")]
    Exhausted { id: Uuid, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryOutcome {
    pub record: ErrorDetail,
    pub succeeded: bool,
    /// Suggested wait before another manual attempt. Nothing is scheduled.
    pub next_delay: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub total: usize,
    pub unresolved: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub unresolved_critical: Vec<ErrorDetail>,
    pub recent: Vec<ErrorDetail>,
}

/// Tagged result of a call wrapped by [`ErrorTracker::capture`].
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    Failed(ErrorDetail),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(v) => Some(v),
            Outcome::Failed(_) => None,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    errors: Vec<ErrorDetail>,
    handlers: Vec<(HandlerMatch, ErrorHandler)>,
    thresholds: Vec<ErrorThreshold>,
    alert: Option<AlertCallback>,
}

pub struct ErrorTracker {
    state: Mutex<TrackerState>,
    retry_policy: RetryPolicy,
    recent_limit: usize,
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl ErrorTracker {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            retry_policy,
            recent_limit: 20,
        }
    }

    pub async fn register_handler(&self, pattern: HandlerMatch, handler: ErrorHandler) {
        self.state.lock().await.handlers.push((pattern, handler));
    }

    pub async fn add_threshold(&self, threshold: ErrorThreshold) {
        self.state.lock().await.thresholds.push(threshold);
    }

    pub async fn on_alert(&self, callback: AlertCallback) {
        self.state.lock().await.alert = Some(callback);
    }

    pub async fn track_error(&self, new: NewError) -> ErrorDetail {
        let detail = ErrorDetail {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category: new.category,
            severity: new.severity,
            message: new.message,
            context: new.context,
            retryable: new.retryable,
            retry_count: 0,
            resolved: false,
            resolved_at: None,
            resolution: None,
        };

        if detail.severity >= Severity::High {
            error!(category = %detail.category, severity = %detail.severity, id = %detail.id, "{}", detail.message);
        } else {
            warn!(category = %detail.category, severity = %detail.severity, id = %detail.id, "{}", detail.message);
        }

        let (handlers, found, alert) = {
            let mut state = self.state.lock().await;
            state.errors.push(detail.clone());
            let handlers: Vec<ErrorHandler> = state
                .handlers
                .iter()
                .filter(|(pattern, _)| pattern.matches(&detail))
                .map(|(_, handler)| handler.clone())
                .collect();
            let found = breaches(&state, detail.timestamp);
            (handlers, found, state.alert.clone())
        };

        // Callbacks run outside the lock so they may call back into the tracker.
        for handler in handlers {
            handler(&detail);
        }
        if let (false, Some(alert)) = (found.is_empty(), alert) {
            alert(&found);
        }
        detail
    }

    pub async fn track_auto_error(
        &self,
        error: &(impl fmt::Display + ?Sized),
        context: JsonValue,
    ) -> ErrorDetail {
        let message = error.to_string();
        let class = classify(&message);
        self.track_error(NewError {
            category: class.category,
            severity: class.severity,
            message,
            context,
            retryable: class.retryable,
        })
        .await
    }

    /// Run the threshold pass on its own and return every breach.
    pub async fn check_thresholds(&self) -> Vec<ThresholdBreach> {
        let (found, alert) = {
            let state = self.state.lock().await;
            (breaches(&state, Utc::now()), state.alert.clone())
        };
        if let (false, Some(alert)) = (found.is_empty(), alert) {
            alert(&found);
        }
        found
    }

    pub async fn get(&self, id: Uuid) -> Option<ErrorDetail> {
        self.state
            .lock()
            .await
            .errors
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub async fn errors(&self) -> Vec<ErrorDetail> {
        self.state.lock().await.errors.clone()
    }

    pub async fn unresolved_critical(&self) -> Vec<ErrorDetail> {
        self.state
            .lock()
            .await
            .errors
            .iter()
            .filter(|e| !e.resolved && e.severity == Severity::Critical)
            .cloned()
            .collect()
    }

    /// Retry the operation behind a tracked error once. The stored record is
    /// replaced by the policy's new record; nothing is rescheduled.
    pub async fn retry_error<F, Fut, T>(
        &self,
        id: Uuid,
        operation: F,
    ) -> Result<RetryOutcome, TrackerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let record = self.get(id).await.ok_or(TrackerError::NotFound(id))?;
        let attempt = match self.retry_policy.evaluate(&record) {
            RetryDecision::Attempt { attempt, .. } => attempt,
            RetryDecision::NotRetryable => return Err(TrackerError::NotRetryable(id)),
            RetryDecision::AlreadyResolved => return Err(TrackerError::AlreadyResolved(id)),
            RetryDecision::Exhausted { attempts } => {
                return Err(TrackerError::Exhausted { id, attempts })
            }
        };

        let outcome = operation().await.map(|_| ()).map_err(|err| format!("{err:#}"));
        let succeeded = outcome.is_ok();
        let next = self.retry_policy.apply(&record, attempt, outcome, Utc::now());

        {
            let mut state = self.state.lock().await;
            if let Some(slot) = state.errors.iter_mut().find(|e| e.id == id) {
                *slot = next.clone();
            }
        }

        let next_delay = match self.retry_policy.evaluate(&next) {
            RetryDecision::Attempt { delay, .. } => Some(delay),
            _ => None,
        };
        Ok(RetryOutcome {
            record: next,
            succeeded,
            next_delay,
        })
    }

    pub async fn resolve_error(
        &self,
        id: Uuid,
        resolution: impl Into<String>,
    ) -> Result<ErrorDetail, TrackerError> {
        let mut state = self.state.lock().await;
        let slot = state
            .errors
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(TrackerError::NotFound(id))?;
        if slot.resolved {
            return Err(TrackerError::AlreadyResolved(id));
        }
        let mut next = slot.clone();
        next.resolved = true;
        next.resolved_at = Some(Utc::now());
        next.resolution = Some(resolution.into());
        *slot = next.clone();
        Ok(next)
    }

    pub async fn export(&self) -> ErrorSummary {
        let state = self.state.lock().await;
        let mut summary = ErrorSummary {
            total: state.errors.len(),
            ..ErrorSummary::default()
        };
        for error in &state.errors {
            *summary
                .by_category
                .entry(error.category.as_str().to_string())
                .or_default() += 1;
            *summary
                .by_severity
                .entry(error.severity.as_str().to_string())
                .or_default() += 1;
            if !error.resolved {
                summary.unresolved += 1;
                if error.severity == Severity::Critical {
                    summary.unresolved_critical.push(error.clone());
                }
            }
        }
        let mut recent = state.errors.clone();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(self.recent_limit);
        summary.recent = recent;
        summary
    }

    /// Drop resolved errors older than `retention`. Returns how many went.
    pub async fn cleanup(&self, retention: Duration) -> usize {
        let cutoff = window_start(Utc::now(), retention);
        let mut state = self.state.lock().await;
        let before = state.errors.len();
        state
            .errors
            .retain(|e| !(e.resolved && e.timestamp < cutoff));
        before - state.errors.len()
    }

    /// Wrap a call-site result, tracking the failure when there is one.
    pub async fn capture<T>(&self, context: JsonValue, result: anyhow::Result<T>) -> Outcome<T> {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(err) => Outcome::Failed(self.track_auto_error(&format!("{err:#}"), context).await),
        }
    }
}

/// Start of the trailing `window` that ends at `now`. Windows reaching past
/// the earliest representable instant start there.
pub(crate) fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn breaches(state: &TrackerState, now: DateTime<Utc>) -> Vec<ThresholdBreach> {
    state
        .thresholds
        .iter()
        .filter_map(|threshold| {
            let since = window_start(now, threshold.window);
            let count = state
                .errors
                .iter()
                .filter(|e| {
                    !e.resolved
                        && e.category == threshold.category
                        && e.severity >= threshold.min_severity
                        && e.timestamp >= since
                })
                .count();
            (count >= threshold.max_count).then(|| ThresholdBreach {
                threshold: threshold.clone(),
                count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn etimedout_is_a_retryable_network_error() {
        let class = classify("ETIMEDOUT while connecting");
        assert_eq!(class.category, ErrorCategory::Network);
        assert_eq!(class.severity, Severity::Medium);
        assert!(class.retryable);
    }

    #[test]
    fn permission_denied_is_critical_and_permanent() {
        let class = classify("permission denied for relation x");
        assert_eq!(class.category, ErrorCategory::Store);
        assert_eq!(class.severity, Severity::Critical);
        assert!(!class.retryable);
    }

    #[test]
    fn quota_text_raises_severity_and_unknown_text_defaults_to_sync() {
        assert_eq!(classify("warehouse quota exceeded").severity, Severity::High);
        let class = classify("something odd happened");
        assert_eq!(class.category, ErrorCategory::Sync);
        assert!(!class.retryable);
    }

    #[test]
    fn rules_are_ordered() {
        // Network precedes store, so a store connection timeout is retryable network.
        let class = classify("database connection timed out");
        assert_eq!(class.category, ErrorCategory::Network);
        assert!(class.retryable);
        // Permanent patterns win over transient ones.
        assert!(!classify("invalid token (temporary outage)").retryable);
    }

    #[tokio::test]
    async fn alert_fires_once_per_pass() {
        let tracker = ErrorTracker::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        tracker
            .add_threshold(ErrorThreshold {
                category: ErrorCategory::Network,
                min_severity: Severity::Medium,
                max_count: 2,
                window: Duration::from_secs(3600),
            })
            .await;
        tracker
            .add_threshold(ErrorThreshold {
                category: ErrorCategory::Network,
                min_severity: Severity::Low,
                max_count: 2,
                window: Duration::from_secs(3600),
            })
            .await;
        tracker
            .on_alert(Arc::new(move |breaches: &[ThresholdBreach]| {
                assert_eq!(breaches.len(), 2);
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        tracker.track_auto_error("ETIMEDOUT while connecting", json!({})).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tracker.track_auto_error("ECONNRESET by peer", json!({})).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handlers_match_on_message_or_category() {
        let tracker = ErrorTracker::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let by_text = hits.clone();
        let by_category = hits.clone();
        tracker
            .register_handler(
                HandlerMatch::MessageContains("Quota".into()),
                Arc::new(move |_| {
                    by_text.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;
        tracker
            .register_handler(
                HandlerMatch::Category(ErrorCategory::Configuration),
                Arc::new(move |_| {
                    by_category.fetch_add(10, Ordering::SeqCst);
                }),
            )
            .await;

        tracker.track_auto_error("warehouse quota exceeded", json!({})).await;
        tracker.track_auto_error("dependency cycle detected", json!({})).await;
        tracker.track_auto_error("nothing matches", json!({})).await;
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn retry_produces_new_records() {
        let tracker = ErrorTracker::default();
        let err = tracker
            .track_auto_error("network unreachable", json!({"table": "public.t"}))
            .await;

        let failed = tracker
            .retry_error(err.id, || async { Err::<(), _>(anyhow::anyhow!("still down")) })
            .await
            .unwrap();
        assert!(!failed.succeeded);
        assert_eq!(failed.record.retry_count, 1);
        assert!(failed.record.message.contains("retry attempt 1 failed"));
        assert!(failed.next_delay.is_some());

        let ok = tracker
            .retry_error(err.id, || async { Ok(()) })
            .await
            .unwrap();
        assert!(ok.succeeded);
        assert!(ok.record.resolved);
        assert_eq!(ok.record.retry_count, 2);
        assert!(ok.record.message.starts_with("network unreachable (retry attempt 1"));
        assert!(matches!(
            tracker.retry_error(err.id, || async { Ok(()) }).await,
            Err(TrackerError::AlreadyResolved(_))
        ));
    }

    #[tokio::test]
    async fn non_retryable_errors_are_rejected() {
        let tracker = ErrorTracker::default();
        let err = tracker
            .track_auto_error("permission denied for relation x", json!({}))
            .await;
        let result = tracker.retry_error(err.id, || async { Ok(()) }).await;
        assert!(matches!(result, Err(TrackerError::NotRetryable(_))));
        assert_eq!(tracker.get(err.id).await.unwrap().retry_count, 0);
    }

    #[test]
    fn retry_policy_is_exhausted_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let mut record = ErrorDetail {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category: ErrorCategory::Network,
            severity: Severity::Medium,
            message: "timeout".into(),
            context: json!({}),
            retryable: true,
            retry_count: 0,
            resolved: false,
            resolved_at: None,
            resolution: None,
        };
        assert!(matches!(
            policy.evaluate(&record),
            RetryDecision::Attempt { attempt: 1, .. }
        ));
        record = policy.apply(&record, 1, Err("again".into()), Utc::now());
        assert_eq!(
            policy.evaluate(&record),
            RetryDecision::Exhausted { attempts: 1 }
        );
    }

    #[tokio::test]
    async fn export_and_cleanup() {
        let tracker = ErrorTracker::default();
        let critical = tracker
            .track_auto_error("authentication failed for warehouse", json!({}))
            .await;
        let low = tracker
            .track_error(NewError::new(
                ErrorCategory::DataQuality,
                Severity::Low,
                "3 unresolved child rows",
            ))
            .await;
        tracker.resolve_error(low.id, "backfilled").await.unwrap();

        let summary = tracker.export().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.unresolved_critical[0].id, critical.id);
        assert_eq!(summary.by_category.get("data_quality"), Some(&1));
        assert_eq!(summary.by_severity.get("critical"), Some(&1));

        // Zero retention purges every resolved error, never unresolved ones.
        assert_eq!(tracker.cleanup(Duration::ZERO).await, 1);
        assert_eq!(tracker.errors().await.len(), 1);
    }

    #[tokio::test]
    async fn retention_beyond_the_calendar_keeps_everything() {
        let tracker = ErrorTracker::default();
        let low = tracker
            .track_error(NewError::new(ErrorCategory::DataQuality, Severity::Low, "1 row dropped"))
            .await;
        tracker.resolve_error(low.id, "backfilled").await.unwrap();

        let forever = Duration::from_secs(u64::from(u32::MAX) * 24 * 3600);
        assert_eq!(tracker.cleanup(forever).await, 0);
        assert_eq!(tracker.cleanup(Duration::MAX).await, 0);
        assert_eq!(tracker.errors().await.len(), 1);
        assert_eq!(window_start(Utc::now(), Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn capture_tags_failures() {
        let tracker = ErrorTracker::default();
        let ok = tracker.capture(json!({}), Ok::<_, anyhow::Error>(5)).await;
        assert_eq!(ok.ok(), Some(5));

        let failed = tracker
            .capture::<()>(json!({"step": "load"}), Err(anyhow::anyhow!("duplicate key value")))
            .await;
        match failed {
            Outcome::Failed(detail) => {
                assert_eq!(detail.category, ErrorCategory::Store);
                assert_eq!(detail.context["step"], "load");
            }
            Outcome::Ok(_) => panic!("expected failure"),
        }
    }
}
