//! Pagination controller: pages through one result set, rolling over to a date
//! cursor whenever the source's offset ceiling is reached.

use chrono::{DateTime, NaiveDate, Utc};
use inat_adapters::{PageFetcher, RecordExtractor};
use inat_core::{crosses_offset_ceiling, ObservationRecord, PageResult, Query};
use inat_storage::{AccretionStore, CheckpointStore, TableName};
use serde::Serialize;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::error::ScrapeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    NotStarted,
    Paging { page: u64 },
    /// `page` was full and the page after it would pass the offset ceiling.
    CeilingReached { page: u64 },
    /// Cursor has been checkpointed; the next step starts a new partition at page 1.
    RollingOver { cursor: NaiveDate },
    Exhausted,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub pages_fetched: u64,
    pub records_extracted: u64,
    /// Payloads the extractor could not identify.
    pub records_skipped: u64,
    pub records_inserted: u64,
    pub duplicates_ignored: u64,
    pub rollovers: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub place_id: u64,
    pub taxon_id: u64,
    pub table: String,
    pub resumed_from: Option<NaiveDate>,
    pub final_cursor: Option<NaiveDate>,
    #[serde(flatten)]
    pub stats: RunStats,
}

pub struct PaginationController {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    query: Query,
    table: TableName,
    fetcher: Box<dyn PageFetcher>,
    extractor: Box<dyn RecordExtractor>,
    store: Box<dyn AccretionStore>,
    checkpoint: Box<dyn CheckpointStore>,
    state: ControllerState,
    stats: RunStats,
    resumed_from: Option<NaiveDate>,
    /// Newest date seen so far; dates must never go backwards.
    last_dated: Option<NaiveDate>,
    /// Last dated record of the most recently processed page.
    page_cursor: Option<NaiveDate>,
}

impl PaginationController {
    pub fn new(
        query: Query,
        table: TableName,
        fetcher: Box<dyn PageFetcher>,
        extractor: Box<dyn RecordExtractor>,
        store: Box<dyn AccretionStore>,
        checkpoint: Box<dyn CheckpointStore>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            query,
            table,
            fetcher,
            extractor,
            store,
            checkpoint,
            state: ControllerState::NotStarted,
            stats: RunStats::default(),
            resumed_from: None,
            last_dated: None,
            page_cursor: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// `NotStarted -> Paging`. Seeds the query from an existing checkpoint, or
    /// validates the configured start page for a fresh job before anything is fetched.
    pub async fn start(&mut self) -> Result<ControllerState, ScrapeError> {
        if self.state != ControllerState::NotStarted {
            return Err(self.invalid("start"));
        }
        let result = self.begin().await;
        self.settle(result)
    }

    /// Perform exactly one transition out of `Paging`, `CeilingReached` or `RollingOver`.
    pub async fn step(&mut self) -> Result<ControllerState, ScrapeError> {
        let result = match self.state {
            ControllerState::Paging { page } => self.process_page(page).await,
            ControllerState::CeilingReached { page } => self.checkpoint_cursor(page).await,
            ControllerState::RollingOver { cursor } => self.open_partition(cursor),
            ControllerState::NotStarted | ControllerState::Exhausted | ControllerState::Failed => {
                return Err(self.invalid("step"));
            }
        };
        self.settle(result)
    }

    /// Terminal success: the result set is exhausted, so the checkpoint goes away.
    pub async fn finish(&mut self) -> Result<ScrapeSummary, ScrapeError> {
        if self.state != ControllerState::Exhausted {
            return Err(self.invalid("finish"));
        }
        if let Err(err) = self.checkpoint.clear().await {
            return Err(self.fail(err.into()));
        }

        let summary = ScrapeSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            place_id: self.query.place_id,
            taxon_id: self.query.taxon_id,
            table: self.table.to_string(),
            resumed_from: self.resumed_from,
            final_cursor: self.query.date_cursor,
            stats: self.stats,
        };
        info!(
            pages = summary.stats.pages_fetched,
            inserted = summary.stats.records_inserted,
            duplicates = summary.stats.duplicates_ignored,
            rollovers = summary.stats.rollovers,
            "all observations scraped"
        );
        Ok(summary)
    }

    /// Drive the job from `NotStarted` to a summary.
    pub async fn run(&mut self) -> Result<ScrapeSummary, ScrapeError> {
        let span = info_span!("scrape_job", run_id = %self.run_id, table = %self.table);
        async {
            info!(
                place_id = self.query.place_id,
                taxon_id = self.query.taxon_id,
                per_page = self.query.page_size,
                "scrape job started"
            );
            self.start().await?;
            while self.step().await? != ControllerState::Exhausted {}
            self.finish().await
        }
        .instrument(span)
        .await
    }

    async fn begin(&mut self) -> Result<ControllerState, ScrapeError> {
        match self.checkpoint.read().await? {
            Some(cursor) => {
                self.query.validate_depth(1)?;
                self.query.date_cursor = Some(cursor);
                self.query.start_page = 1;
                self.last_dated = Some(cursor);
                self.resumed_from = Some(cursor);
                info!(%cursor, "resuming rolled-over scan from checkpoint at page 1");
            }
            None => self.query.validate_depth(self.query.start_page)?,
        }
        self.store.ensure_schema(&self.table).await?;
        Ok(ControllerState::Paging {
            page: self.query.start_page,
        })
    }

    async fn process_page(&mut self, page: u64) -> Result<ControllerState, ScrapeError> {
        self.query.validate_depth(page)?;
        let result = self.fetcher.fetch_page(&self.query, page).await?;
        self.stats.pages_fetched += 1;

        let records = self.extract_ordered(&result)?;
        let written = self.store.upsert_page(&self.table, &records).await?;
        self.stats.records_extracted += records.len() as u64;
        self.stats.records_inserted += written.inserted as u64;
        self.stats.duplicates_ignored += written.ignored as u64;
        debug!(
            page,
            fetched = result.len(),
            inserted = written.inserted,
            ignored = written.ignored,
            "page accreted"
        );

        if result.is_final_page() {
            info!(page, "last page of the result set reached");
            Ok(ControllerState::Exhausted)
        } else if crosses_offset_ceiling(page, self.query.page_size) {
            Ok(ControllerState::CeilingReached { page })
        } else {
            Ok(ControllerState::Paging { page: page + 1 })
        }
    }

    /// Extract every payload on the page, rejecting the page if dates go backwards.
    fn extract_ordered(&mut self, result: &PageResult) -> Result<Vec<ObservationRecord>, ScrapeError> {
        let mut records = Vec::with_capacity(result.len());
        let mut last_dated = self.last_dated;
        let mut page_cursor = None;

        for raw in &result.raw {
            let Some(record) = self.extractor.extract(raw) else {
                self.stats.records_skipped += 1;
                continue;
            };
            if let Some(date) = record.date {
                if let Some(previous) = last_dated.filter(|prev| date < *prev) {
                    return Err(ScrapeError::SourceOrderingViolation {
                        id: record.id,
                        previous,
                        found: date,
                        page: result.page,
                    });
                }
                last_dated = Some(date);
                page_cursor = Some(date);
            }
            records.push(record);
        }

        self.last_dated = last_dated;
        self.page_cursor = page_cursor;
        Ok(records)
    }

    /// `CeilingReached -> RollingOver`: persist the cursor before paging on.
    /// An undated ceiling page falls back to the newest date seen earlier.
    async fn checkpoint_cursor(&mut self, page: u64) -> Result<ControllerState, ScrapeError> {
        let cursor = self
            .page_cursor
            .or(self.last_dated)
            .ok_or(ScrapeError::MissingCursorDate { page })?;
        if self.query.date_cursor == Some(cursor) {
            return Err(ScrapeError::StalledCursor { cursor });
        }
        self.checkpoint.write(cursor).await?;
        Ok(ControllerState::RollingOver { cursor })
    }

    /// `RollingOver -> Paging`. The cursor is inclusive, so the boundary date's
    /// records are fetched again and dropped by the store's insert-or-ignore.
    fn open_partition(&mut self, cursor: NaiveDate) -> Result<ControllerState, ScrapeError> {
        self.query.date_cursor = Some(cursor);
        self.query.start_page = 1;
        self.stats.rollovers += 1;
        info!(
            %cursor,
            scraped = self.stats.records_extracted,
            partition = self.stats.rollovers + 1,
            "offset ceiling reached; continuing from date cursor"
        );
        Ok(ControllerState::Paging { page: 1 })
    }

    fn settle(
        &mut self,
        result: Result<ControllerState, ScrapeError>,
    ) -> Result<ControllerState, ScrapeError> {
        match result {
            Ok(next) => {
                self.state = next;
                Ok(next)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn fail(&mut self, err: ScrapeError) -> ScrapeError {
        error!(state = ?self.state, error = %err, "scrape job halted; checkpoint left for resume");
        self.state = ControllerState::Failed;
        err
    }

    fn invalid(&self, operation: &'static str) -> ScrapeError {
        ScrapeError::InvalidState {
            operation,
            state: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use inat_adapters::JsonObservationExtractor;
    use inat_storage::{FetchError, FileCheckpointStore, SqliteAccretionStore};
    use serde_json::{json, Value as JsonValue};
    use std::sync::{Arc, Mutex};
    use tempfile::{tempdir, TempDir};

    /// Serves canned pages in order and records the queries it saw.
    struct ScriptedFetcher {
        pages: Mutex<Vec<Result<Vec<JsonValue>, FetchError>>>,
        seen: Arc<Mutex<Vec<(u64, Option<NaiveDate>)>>>,
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(&self, query: &Query, page: u64) -> Result<PageResult, FetchError> {
            self.seen
                .lock()
                .expect("seen")
                .push((page, query.date_cursor));
            let next = self.pages.lock().expect("pages").remove(0);
            next.map(|raw| PageResult::new(page, query.page_size, raw))
        }
    }

    fn obs(id: i64, date: &str) -> JsonValue {
        json!({"id": id, "observed_on_details": {"date": date}, "taxon": {"name": "Naja annulifera"}})
    }

    fn day(s: &str) -> NaiveDate {
        inat_core::parse_date(s).expect("date")
    }

    struct Harness {
        _dir: TempDir,
        controller: PaginationController,
        checkpoint: FileCheckpointStore,
        store: SqliteAccretionStore,
        table: TableName,
        seen: Arc<Mutex<Vec<(u64, Option<NaiveDate>)>>>,
    }

    async fn harness(query: Query, pages: Vec<Result<Vec<JsonValue>, FetchError>>) -> Harness {
        let dir = tempdir().expect("tempdir");
        let store = SqliteAccretionStore::open(dir.path(), "snakes")
            .await
            .expect("store");
        let checkpoint = FileCheckpointStore::for_job(dir.path(), "snakes", "obs");
        let table = TableName::parse("obs").expect("table");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fetcher = ScriptedFetcher {
            pages: Mutex::new(pages),
            seen: Arc::clone(&seen),
        };
        let controller = PaginationController::new(
            query,
            table.clone(),
            Box::new(fetcher),
            Box::new(JsonObservationExtractor),
            Box::new(store.clone()),
            Box::new(checkpoint.clone()),
        );
        Harness {
            _dir: dir,
            controller,
            checkpoint,
            store,
            table,
            seen,
        }
    }

    #[tokio::test]
    async fn page_99_of_100_stays_paging_and_page_100_reaches_the_ceiling() {
        let full = |base: i64| (0..100).map(|i| obs(base + i, "2001-01-01")).collect::<Vec<_>>();
        let mut h = harness(
            Query::new(1, 1, 100, 99),
            vec![Ok(full(0)), Ok(full(100))],
        )
        .await;

        assert_eq!(h.controller.start().await.expect("start"), ControllerState::Paging { page: 99 });
        assert_eq!(h.controller.step().await.expect("p99"), ControllerState::Paging { page: 100 });
        assert_eq!(
            h.controller.step().await.expect("p100"),
            ControllerState::CeilingReached { page: 100 }
        );
        assert_eq!(h.checkpoint.read().await.expect("read"), None);
    }

    #[tokio::test]
    async fn ceiling_checkpoints_last_date_and_restarts_at_page_one() {
        let page = |ids: std::ops::Range<i64>, date: &str| ids.map(|i| obs(i, date)).collect::<Vec<_>>();
        let mut h = harness(
            Query::new(1, 1, 5_000, 1),
            vec![
                Ok(page(0..5_000, "1990-01-01")),
                Ok([page(5_000..9_999, "1990-01-01"), page(9_999..10_000, "1995-06-30")].concat()),
                Ok(page(9_999..10_003, "1995-06-30")),
            ],
        )
        .await;

        h.controller.start().await.expect("start");
        assert_eq!(h.controller.step().await.expect("p1"), ControllerState::Paging { page: 2 });
        assert_eq!(
            h.controller.step().await.expect("p2"),
            ControllerState::CeilingReached { page: 2 }
        );

        let cursor = day("1995-06-30");
        assert_eq!(
            h.controller.step().await.expect("checkpoint"),
            ControllerState::RollingOver { cursor }
        );
        assert_eq!(h.checkpoint.read().await.expect("read"), Some(cursor));

        assert_eq!(h.controller.step().await.expect("roll"), ControllerState::Paging { page: 1 });
        assert_eq!(h.controller.query().date_cursor, Some(cursor));
        assert_eq!(h.controller.query().start_page, 1);

        assert_eq!(h.controller.step().await.expect("p1'"), ControllerState::Exhausted);
        let summary = h.controller.finish().await.expect("finish");
        assert_eq!(summary.stats.rollovers, 1);
        assert_eq!(summary.stats.records_inserted, 10_003);
        assert_eq!(summary.stats.duplicates_ignored, 1);
        assert_eq!(h.checkpoint.read().await.expect("read"), None);
        assert_eq!(h.store.row_count(&h.table).await.expect("count"), 10_003);

        let seen = h.seen.lock().expect("seen").clone();
        assert_eq!(seen, vec![(1, None), (2, None), (1, Some(cursor))]);
    }

    #[tokio::test]
    async fn fresh_job_past_the_ceiling_fails_before_fetching() {
        let mut h = harness(Query::new(1, 1, 100, 101), vec![]).await;
        let err = h.controller.run().await.expect_err("config error");
        assert_eq!(err.exit_kind(), crate::ExitKind::ConfigurationError);
        assert_eq!(h.controller.state(), ControllerState::Failed);
        assert!(h.seen.lock().expect("seen").is_empty());
    }

    #[tokio::test]
    async fn existing_checkpoint_overrides_start_page() {
        let mut h = harness(
            Query::new(1, 1, 100, 101),
            vec![Ok(vec![obs(1, "2010-03-04"), obs(2, "2010-03-05")])],
        )
        .await;
        h.checkpoint.write(day("2010-03-04")).await.expect("seed");

        assert_eq!(h.controller.start().await.expect("start"), ControllerState::Paging { page: 1 });
        let summary = h.controller.run_remaining().await;
        assert_eq!(summary.resumed_from, Some(day("2010-03-04")));
        assert_eq!(summary.stats.records_inserted, 2);
        assert_eq!(h.seen.lock().expect("seen")[0], (1, Some(day("2010-03-04"))));
        assert_eq!(h.checkpoint.read().await.expect("read"), None);
    }

    #[tokio::test]
    async fn dates_going_backwards_fail_without_writing_the_page() {
        let mut h = harness(
            Query::new(1, 1, 3, 1),
            vec![
                Ok(vec![obs(1, "2000-01-01"), obs(2, "2000-01-02"), obs(3, "2000-01-03")]),
                Ok(vec![obs(4, "2000-01-04"), obs(5, "1999-12-31")]),
            ],
        )
        .await;
        let err = h.controller.run().await.expect_err("ordering");
        assert!(matches!(
            err,
            ScrapeError::SourceOrderingViolation { id: 5, page: 2, .. }
        ));
        assert_eq!(h.controller.state(), ControllerState::Failed);
        assert_eq!(h.store.row_count(&h.table).await.expect("count"), 3);
        assert!(h.controller.step().await.is_err());
    }

    #[tokio::test]
    async fn fetch_failure_halts_and_leaves_checkpoint_in_place() {
        let mut h = harness(
            Query::new(1, 1, 2, 1),
            vec![Err(FetchError::Server {
                status: 503,
                url: "https://api.inaturalist.org/v1/observations".into(),
            })],
        )
        .await;
        h.checkpoint.write(day("2015-01-01")).await.expect("seed");

        let err = h.controller.run().await.expect_err("server");
        assert_eq!(err.exit_kind(), crate::ExitKind::RuntimeFailure);
        assert_eq!(h.checkpoint.read().await.expect("read"), Some(day("2015-01-01")));
    }

    #[tokio::test]
    async fn full_partition_on_a_single_date_is_reported_as_stalled() {
        let same_day = |base: i64| (0..5_000).map(|i| obs(base + i, "2020-05-01")).collect::<Vec<_>>();
        let mut h = harness(
            Query::new(1, 1, 5_000, 1),
            vec![Ok(same_day(0)), Ok(same_day(5_000)), Ok(same_day(0)), Ok(same_day(5_000))],
        )
        .await;
        let err = h.controller.run().await.expect_err("stalled");
        assert!(matches!(err, ScrapeError::StalledCursor { .. }));
        assert_eq!(h.checkpoint.read().await.expect("read"), Some(day("2020-05-01")));
    }

    #[tokio::test]
    async fn undated_ceiling_page_cannot_roll_over() {
        let undated = |base: i64| (0..5_000).map(|i| json!({"id": base + i})).collect::<Vec<_>>();
        let mut h = harness(
            Query::new(1, 1, 5_000, 1),
            vec![Ok(undated(0)), Ok(undated(5_000))],
        )
        .await;
        let err = h.controller.run().await.expect_err("no cursor");
        assert!(matches!(err, ScrapeError::MissingCursorDate { page: 2 }));
    }

    #[tokio::test]
    async fn undated_ceiling_page_rolls_over_from_the_last_dated_page() {
        let dated = (0..5_000).map(|i| obs(i, "2003-07-15")).collect::<Vec<_>>();
        let undated = (5_000..10_000).map(|i| json!({"id": i})).collect::<Vec<_>>();
        let mut h = harness(
            Query::new(1, 1, 5_000, 1),
            vec![Ok(dated), Ok(undated), Ok(vec![obs(10_000, "2003-07-16")])],
        )
        .await;

        let summary = h.controller.run().await.expect("run");
        assert_eq!(summary.stats.rollovers, 1);
        assert_eq!(summary.final_cursor, Some(day("2003-07-15")));
        assert_eq!(h.store.row_count(&h.table).await.expect("count"), 10_001);
        assert_eq!(h.seen.lock().expect("seen")[2], (1, Some(day("2003-07-15"))));
    }

    impl PaginationController {
        async fn run_remaining(&mut self) -> ScrapeSummary {
            while self.step().await.expect("step") != ControllerState::Exhausted {}
            self.finish().await.expect("finish")
        }
    }
}
