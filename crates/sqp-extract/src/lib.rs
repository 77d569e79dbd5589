//! Warehouse extraction: full, incremental (watermarked) and streamed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqp_core::{max_watermark, ExtractFilter, SourceRow, TemporalColumn};
use sqp_storage::FetchError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

mod source;
mod validate;

pub use source::{load_snapshot, FixtureWarehouse, HttpWarehouse, WarehouseSnapshot, WarehouseSource};
pub use validate::{validate_rows, IssueKind, ValidationIssue, ValidationReport};

pub const CRATE_NAME: &str = "sqp-extract";

pub const DEFAULT_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("warehouse query failed: {0}")]
    Warehouse(String),
    #[error("warehouse request failed: {0}")]
    Http(#[from] FetchError),
    #[error("reading warehouse fixture {path}: {message}")]
    Fixture { path: String, message: String },
    #[error("batch consumer failed on page {page}: {message}")]
    Consumer { page: usize, message: String },
    #[error("stream aborted on page {page}: {source}")]
    StreamAborted {
        page: usize,
        #[source]
        source: Box<ExtractError>,
    },
    #[error("stream gave up after {failures} consecutive failed pages")]
    TooManyFailures { failures: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Extraction {
    pub rows: Vec<SourceRow>,
    pub diagnostics: Option<ValidationReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalCursor {
    pub last_processed: Option<DateTime<Utc>>,
    pub column: TemporalColumn,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IncrementalExtraction {
    pub rows: Vec<SourceRow>,
    pub new_watermark: Option<DateTime<Utc>>,
}

/// What to do when a page cannot be fetched. There is deliberately no default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageErrorPolicy {
    Abort,
    SkipAndContinue,
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub batch_size: usize,
    pub on_page_error: PageErrorPolicy,
    pub max_consecutive_failures: usize,
    pub cursor_column: TemporalColumn,
    pub cancel: CancellationToken,
}

impl StreamOptions {
    pub fn new(batch_size: usize, on_page_error: PageErrorPolicy) -> Self {
        Self {
            batch_size: batch_size.max(1),
            on_page_error,
            max_consecutive_failures: 3,
            cursor_column: TemporalColumn::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cursor_column(mut self, column: TemporalColumn) -> Self {
        self.cursor_column = column;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: usize) -> Self {
        self.max_consecutive_failures = failures.max(1);
        self
    }
}

/// One page handed to [`StreamObserver::on_data`].
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub page: usize,
    pub rows: Vec<SourceRow>,
    /// Watermark that is safe to persist once this batch is committed. `None`
    /// after any earlier page was skipped.
    pub commit_watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub processed: u64,
    pub total: Option<u64>,
    pub percent: Option<f64>,
}

impl Progress {
    fn new(processed: u64, total: Option<u64>) -> Self {
        let percent = total.map(|t| {
            if t == 0 {
                100.0
            } else {
                (processed as f64 / t as f64 * 100.0).min(100.0)
            }
        });
        Self {
            processed,
            total,
            percent,
        }
    }
}

#[async_trait]
pub trait StreamObserver: Send {
    /// Handle one batch. The next page is not fetched until this returns.
    async fn on_data(&mut self, batch: Batch) -> anyhow::Result<()>;

    async fn on_progress(&mut self, _progress: Progress) {}

    async fn on_error(&mut self, _page: usize, _error: &ExtractError) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamSummary {
    pub pages: usize,
    pub rows_processed: u64,
    pub skipped_pages: usize,
    pub cancelled: bool,
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Extractor {
    source: Arc<dyn WarehouseSource>,
    page_size: usize,
}

impl Extractor {
    pub fn new(source: Arc<dyn WarehouseSource>) -> Self {
        Self {
            source,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    async fn fetch_all(&self, filter: &ExtractFilter) -> Result<Vec<SourceRow>, ExtractError> {
        let mut rows = Vec::new();
        let mut offset = 0u64;
        loop {
            let page = self.source.fetch_page(filter, offset, self.page_size).await?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < self.page_size {
                break;
            }
            offset += fetched as u64;
        }
        Ok(rows)
    }

    pub async fn extract_full(
        &self,
        filter: &ExtractFilter,
        validate: bool,
    ) -> Result<Extraction, ExtractError> {
        let span = info_span!("extract_full", source = self.source.name());
        async {
            let rows = self.fetch_all(filter).await?;
            let diagnostics = validate.then(|| validate_rows(&rows));
            if let Some(report) = &diagnostics {
                if !report.is_clean() {
                    warn!(issues = report.issues.len(), "extracted rows failed validation checks");
                }
            }
            debug!(rows = rows.len(), "full extraction finished");
            Ok(Extraction { rows, diagnostics })
        }
        .instrument(span)
        .await
    }

    /// Rows with `cursor.column >= cursor.last_processed`. Boundary rows are
    /// re-read on purpose; the loader's upserts make that harmless.
    pub async fn extract_incremental(
        &self,
        filter: &ExtractFilter,
        cursor: IncrementalCursor,
    ) -> Result<IncrementalExtraction, ExtractError> {
        let filter = filter
            .clone()
            .with_since(cursor.column, cursor.last_processed);
        let rows = self.fetch_all(&filter).await?;
        let observed = rows.iter().map(|r| cursor.column.value_of(r)).max();
        Ok(IncrementalExtraction {
            new_watermark: max_watermark(cursor.last_processed, observed),
            rows,
        })
    }

    /// Page through the filter result, handing each batch to `observer`
    /// before fetching the next one.
    pub async fn stream_extraction<O>(
        &self,
        filter: &ExtractFilter,
        observer: &mut O,
        options: &StreamOptions,
    ) -> Result<StreamSummary, ExtractError>
    where
        O: StreamObserver + ?Sized,
    {
        let span = info_span!("stream_extraction", source = self.source.name());
        self.stream_inner(filter, observer, options)
            .instrument(span)
            .await
    }

    async fn stream_inner<O>(
        &self,
        filter: &ExtractFilter,
        observer: &mut O,
        options: &StreamOptions,
    ) -> Result<StreamSummary, ExtractError>
    where
        O: StreamObserver + ?Sized,
    {
        let total = match self.source.count(filter).await {
            Ok(total) => total,
            Err(err) => {
                warn!(error = %err, "row count unavailable; progress will omit percentages");
                None
            }
        };

        let mut summary = StreamSummary::default();
        let mut offset = 0u64;
        let mut page = 0usize;
        let mut consecutive_failures = 0usize;

        loop {
            if options.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            match self
                .source
                .fetch_page(filter, offset, options.batch_size)
                .await
            {
                Ok(rows) => {
                    consecutive_failures = 0;
                    if rows.is_empty() {
                        break;
                    }
                    let fetched = rows.len();
                    let batch_watermark = rows
                        .iter()
                        .map(|r| options.cursor_column.value_of(r))
                        .max();
                    let commit_watermark = if summary.skipped_pages == 0 {
                        max_watermark(summary.watermark, batch_watermark)
                    } else {
                        None
                    };

                    observer
                        .on_data(Batch {
                            page,
                            rows,
                            commit_watermark,
                        })
                        .await
                        .map_err(|err| ExtractError::Consumer {
                            page,
                            message: format!("{err:#}"),
                        })?;

                    summary.pages += 1;
                    summary.rows_processed += fetched as u64;
                    if commit_watermark.is_some() {
                        summary.watermark = commit_watermark;
                    }
                    offset += fetched as u64;
                    observer
                        .on_progress(Progress::new(summary.rows_processed, total))
                        .await;

                    if fetched < options.batch_size {
                        break;
                    }
                }
                Err(err) => {
                    observer.on_error(page, &err).await;
                    match options.on_page_error {
                        PageErrorPolicy::Abort => {
                            return Err(ExtractError::StreamAborted {
                                page,
                                source: Box::new(err),
                            });
                        }
                        PageErrorPolicy::SkipAndContinue => {
                            consecutive_failures += 1;
                            summary.skipped_pages += 1;
                            warn!(page, error = %err, "skipping failed page");
                            if consecutive_failures >= options.max_consecutive_failures {
                                return Err(ExtractError::TooManyFailures {
                                    failures: consecutive_failures,
                                });
                            }
                            offset += options.batch_size as u64;
                            if total.is_some_and(|t| offset >= t) {
                                break;
                            }
                        }
                    }
                }
            }
            page += 1;
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn row(entity: &str, term: &str, hour: u32) -> SourceRow {
        SourceRow {
            entity_id: entity.into(),
            entity_name: Some(format!("{entity} name")),
            period_start: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2026, 3, 7).unwrap(),
            detail_key: term.into(),
            observed_at: Utc.with_ymd_and_hms(2026, 3, 8, hour, 0, 0).unwrap(),
            metrics: BTreeMap::from([("clicks".to_string(), json!(hour))]),
        }
    }

    fn sample_rows() -> Vec<SourceRow> {
        vec![
            row("acct-1", "shoes", 3),
            row("acct-1", "boots", 1),
            row("acct-2", "hats", 2),
            row("acct-2", "scarves", 5),
            row("acct-3", "gloves", 4),
        ]
    }

    fn extractor(rows: Vec<SourceRow>) -> Extractor {
        Extractor::new(Arc::new(FixtureWarehouse::from_rows("test", rows))).with_page_size(2)
    }

    #[derive(Default)]
    struct Collect {
        batches: Vec<Batch>,
        progress: Vec<Progress>,
        errors: Vec<usize>,
    }

    #[async_trait]
    impl StreamObserver for Collect {
        async fn on_data(&mut self, batch: Batch) -> anyhow::Result<()> {
            self.batches.push(batch);
            Ok(())
        }

        async fn on_progress(&mut self, progress: Progress) {
            self.progress.push(progress);
        }

        async fn on_error(&mut self, page: usize, _error: &ExtractError) {
            self.errors.push(page);
        }
    }

    /// Fails the given page indexes (by offset / limit) once each.
    struct Flaky {
        inner: FixtureWarehouse,
        fail_pages: Vec<u64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WarehouseSource for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn count(&self, filter: &ExtractFilter) -> Result<Option<u64>, ExtractError> {
            self.inner.count(filter).await
        }

        async fn fetch_page(
            &self,
            filter: &ExtractFilter,
            offset: u64,
            limit: usize,
        ) -> Result<Vec<SourceRow>, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_pages.contains(&(offset / limit as u64)) {
                return Err(ExtractError::Warehouse("connection reset by peer".into()));
            }
            self.inner.fetch_page(filter, offset, limit).await
        }
    }

    #[tokio::test]
    async fn full_extraction_pages_through_everything_in_cursor_order() {
        let extraction = extractor(sample_rows())
            .extract_full(&ExtractFilter::default(), true)
            .await
            .unwrap();
        let terms: Vec<_> = extraction.rows.iter().map(|r| r.detail_key.as_str()).collect();
        assert_eq!(terms, ["boots", "hats", "shoes", "gloves", "scarves"]);
        assert!(extraction.diagnostics.unwrap().is_clean());
    }

    #[tokio::test]
    async fn incremental_keeps_watermark_when_nothing_is_new() {
        let ex = extractor(sample_rows());
        let cursor = IncrementalCursor {
            last_processed: Some(Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap()),
            column: TemporalColumn::ObservedAt,
        };
        let out = ex
            .extract_incremental(&ExtractFilter::default(), cursor)
            .await
            .unwrap();
        assert!(out.rows.is_empty());
        assert_eq!(out.new_watermark, cursor.last_processed);
    }

    #[tokio::test]
    async fn incremental_reads_from_the_boundary_inclusive() {
        let ex = extractor(sample_rows());
        let cursor = IncrementalCursor {
            last_processed: Some(Utc.with_ymd_and_hms(2026, 3, 8, 4, 0, 0).unwrap()),
            column: TemporalColumn::ObservedAt,
        };
        let out = ex
            .extract_incremental(&ExtractFilter::default(), cursor)
            .await
            .unwrap();
        assert_eq!(out.rows.len(), 2);
        assert_eq!(
            out.new_watermark,
            Some(Utc.with_ymd_and_hms(2026, 3, 8, 5, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn stream_reports_progress_and_watermark() {
        let ex = extractor(sample_rows());
        let mut observer = Collect::default();
        let options = StreamOptions::new(2, PageErrorPolicy::Abort);
        let summary = ex
            .stream_extraction(&ExtractFilter::default(), &mut observer, &options)
            .await
            .unwrap();

        assert_eq!(summary.pages, 3);
        assert_eq!(summary.rows_processed, 5);
        assert_eq!(observer.batches.len(), 3);
        assert_eq!(observer.progress.last().unwrap().percent, Some(100.0));
        assert_eq!(
            summary.watermark,
            Some(Utc.with_ymd_and_hms(2026, 3, 8, 5, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn abort_policy_stops_on_first_failed_page() {
        let source = Flaky {
            inner: FixtureWarehouse::from_rows("inner", sample_rows()),
            fail_pages: vec![1],
            calls: AtomicUsize::new(0),
        };
        let ex = Extractor::new(Arc::new(source));
        let mut observer = Collect::default();
        let err = ex
            .stream_extraction(
                &ExtractFilter::default(),
                &mut observer,
                &StreamOptions::new(2, PageErrorPolicy::Abort),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::StreamAborted { page: 1, .. }));
        assert_eq!(observer.batches.len(), 1);
        assert_eq!(observer.errors, vec![1]);
    }

    #[tokio::test]
    async fn skipped_pages_freeze_the_committable_watermark() {
        let source = Flaky {
            inner: FixtureWarehouse::from_rows("inner", sample_rows()),
            fail_pages: vec![1],
            calls: AtomicUsize::new(0),
        };
        let ex = Extractor::new(Arc::new(source));
        let mut observer = Collect::default();
        let summary = ex
            .stream_extraction(
                &ExtractFilter::default(),
                &mut observer,
                &StreamOptions::new(2, PageErrorPolicy::SkipAndContinue),
            )
            .await
            .unwrap();

        assert_eq!(summary.skipped_pages, 1);
        assert_eq!(summary.rows_processed, 3);
        assert!(observer.batches[1].commit_watermark.is_none());
        assert_eq!(
            summary.watermark,
            Some(Utc.with_ymd_and_hms(2026, 3, 8, 2, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_batches() {
        struct CancelAfterFirst(CancellationToken, usize);

        #[async_trait]
        impl StreamObserver for CancelAfterFirst {
            async fn on_data(&mut self, _batch: Batch) -> anyhow::Result<()> {
                self.1 += 1;
                self.0.cancel();
                Ok(())
            }
        }

        let token = CancellationToken::new();
        let mut observer = CancelAfterFirst(token.clone(), 0);
        let summary = extractor(sample_rows())
            .stream_extraction(
                &ExtractFilter::default(),
                &mut observer,
                &StreamOptions::new(2, PageErrorPolicy::Abort).with_cancel(token),
            )
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(observer.1, 1);
        assert_eq!(summary.rows_processed, 2);
    }
}
