//! Ingestion run orchestration: dedup, materialization, run guard, scheduling.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use relief_adapters::{parse_feed, FeedRow, FieldAliases, FieldExtractor, ParseError};
use relief_core::{
    CandidateRecord, Gender, LocationStatus, LocationType, NewLocation, NewPersonReport,
    PersonStatus, VerificationStatus, INGEST_MARKER, INGEST_REPORTER_NAME, SENTINEL_LATITUDE,
    SENTINEL_LONGITUDE, UNKNOWN_NAME, UNKNOWN_PHONE,
};
use relief_storage::{
    FeedSource, FetchError, HttpClientConfig, HttpFeedFetcher, LocationCriteria, MemoryStore,
    PersonCriteria, PgStore, RecordStore, SnapshotArchive, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "relief-sync";

pub const DEFAULT_FEED_URL: &str = "https://docs.google.com/spreadsheets/d/1eu3esnt3mE2aQabpBWVAjr4OzsGnJTDIY6NOQCNB8ik/export?format=csv&gid=421737196";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub feed_url: String,
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub cooldown: Duration,
    pub run_timeout: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub aliases_path: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(default))
        };
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            feed_url: non_empty("RELIEF_FEED_URL").unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
            database_url: non_empty("DATABASE_URL"),
            scheduler_enabled: lookup("RELIEF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            sync_cron: non_empty("RELIEF_SYNC_CRON").unwrap_or_else(|| "0 */10 * * * *".to_string()),
            cooldown: secs("RELIEF_COOLDOWN_SECS", 300),
            run_timeout: secs("RELIEF_RUN_TIMEOUT_SECS", 240),
            http_timeout: secs("RELIEF_HTTP_TIMEOUT_SECS", 30),
            user_agent: non_empty("RELIEF_USER_AGENT")
                .unwrap_or_else(|| "relief-ingest/0.1".to_string()),
            aliases_path: non_empty("RELIEF_ALIASES_PATH").map(PathBuf::from),
            archive_dir: non_empty("RELIEF_ARCHIVE_DIR").map(PathBuf::from),
        }
    }

    pub fn field_aliases(&self) -> Result<FieldAliases> {
        match &self.aliases_path {
            Some(path) => FieldAliases::load(path),
            None => Ok(FieldAliases::default()),
        }
    }

    pub fn http_fetcher(&self) -> Result<HttpFeedFetcher> {
        HttpFeedFetcher::new(
            self.feed_url.clone(),
            HttpClientConfig {
                timeout: self.http_timeout,
                user_agent: Some(self.user_agent.clone()),
            },
        )
    }
}

/// Postgres when `DATABASE_URL` is set (migrated on open), otherwise an in-memory store.
pub async fn open_store(config: &IngestConfig) -> Result<Arc<dyn RecordStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await?;
            info!("using postgres record store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; records are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

/// Phones must be longer than this to serve as the identity key.
pub const MIN_PHONE_KEY_LEN: usize = 5;

/// Identity key for one candidate. At most one strategy applies per row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Phone(String),
    /// The row's own address, never the area or the placeholder.
    Address(String),
}

impl DedupKey {
    /// `None` when the row has neither a usable phone nor an address; such rows
    /// are always imported as new.
    pub fn for_candidate(candidate: &CandidateRecord) -> Option<Self> {
        if candidate.phone.chars().count() > MIN_PHONE_KEY_LEN {
            Some(DedupKey::Phone(candidate.phone.clone()))
        } else if !candidate.address.is_empty() {
            Some(DedupKey::Address(candidate.address.clone()))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupDecision {
    Duplicate,
    New,
}

/// Exact-match duplicate detection, scoped to one run.
///
/// Keys created earlier in the same run are consulted before the store, so a
/// feed that repeats a row is caught even if the store lags behind.
#[derive(Debug, Default)]
pub struct DedupEngine {
    seen: HashSet<DedupKey>,
}

impl DedupEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn check(
        &self,
        store: &dyn RecordStore,
        key: &DedupKey,
    ) -> Result<DedupDecision, StoreError> {
        if self.seen.contains(key) {
            return Ok(DedupDecision::Duplicate);
        }

        let exists = match key {
            DedupKey::Phone(phone) => store
                .find_one_person(&PersonCriteria {
                    reporter_phone: Some(phone.clone()),
                    description_contains: Some(INGEST_MARKER.to_string()),
                })
                .await?
                .is_some(),
            DedupKey::Address(address) => store
                .find_one_location(&LocationCriteria {
                    address: Some(address.clone()),
                    location_type: Some(LocationType::UserLocation),
                })
                .await?
                .is_some(),
        };

        Ok(if exists {
            DedupDecision::Duplicate
        } else {
            DedupDecision::New
        })
    }

    pub fn record(&mut self, key: DedupKey) {
        self.seen.insert(key);
    }

    pub fn created_this_run(&self) -> usize {
        self.seen.len()
    }
}

// ---------------------------------------------------------------------------
// Materialization
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RowError {
    #[error("duplicate check failed: {0}")]
    DedupCheck(#[source] StoreError),
    #[error("store write failed: {source}")]
    StoreWrite {
        /// Location left behind when the person report write failed.
        orphan_location: Option<Uuid>,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Materialized {
    pub location_id: Uuid,
    pub person_id: Uuid,
}

fn present(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn or_placeholder(value: &str, placeholder: &str) -> String {
    if value.is_empty() {
        placeholder.to_string()
    } else {
        value.to_string()
    }
}

/// Location payload for a new candidate; coordinates stay at the sentinel until geocoded.
pub fn location_for(candidate: &CandidateRecord) -> NewLocation {
    NewLocation {
        latitude: SENTINEL_LATITUDE,
        longitude: SENTINEL_LONGITUDE,
        address: Some(candidate.location_address().to_string()),
        province: None,
        district: present(&candidate.area),
        ward: None,
        street: None,
        location_type: LocationType::UserLocation,
        description: Some(format!("Imported from Sheet. Area: {}", candidate.area)),
        reporter_name: Some(INGEST_REPORTER_NAME.to_string()),
        status: LocationStatus::Active,
        capacity: None,
        current_count: None,
        photo_urls: Vec::new(),
    }
}

pub fn person_for(
    candidate: &CandidateRecord,
    location_id: Uuid,
    now: DateTime<Utc>,
) -> NewPersonReport {
    let phone = or_placeholder(&candidate.phone, UNKNOWN_PHONE);
    NewPersonReport {
        reporter_name: INGEST_REPORTER_NAME.to_string(),
        reporter_phone: phone.clone(),
        full_name: or_placeholder(&candidate.name, UNKNOWN_NAME),
        age: None,
        gender: Gender::Unknown,
        photo_urls: Vec::new(),
        description: candidate.description.clone(),
        last_known_location: location_id,
        last_seen_date: now,
        contact_info: phone,
        status: PersonStatus::NeedHelp,
        found_date: None,
        verification_status: VerificationStatus::Unverified,
    }
}

/// Creates the location, then the person report pointing at it.
///
/// There is no rollback: if the second write fails the location is left
/// orphaned and reported through [`RowError::StoreWrite`].
pub async fn materialize(
    store: &dyn RecordStore,
    candidate: &CandidateRecord,
) -> Result<Materialized, RowError> {
    let location = store
        .create_location(location_for(candidate))
        .await
        .map_err(|source| RowError::StoreWrite {
            orphan_location: None,
            source,
        })?;

    match store
        .create_person(person_for(candidate, location.id, Utc::now()))
        .await
    {
        Ok(person) => Ok(Materialized {
            location_id: location.id,
            person_id: person.id,
        }),
        Err(source) => {
            warn!(
                line = candidate.line,
                location_id = %location.id,
                "person report write failed; location left orphaned"
            );
            Err(RowError::StoreWrite {
                orphan_location: Some(location.id),
                source,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("archiving feed snapshot: {0:#}")]
    Archive(anyhow::Error),
    #[error("ingest run exceeded {secs}s")]
    TimedOut { secs: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed_source: String,
    pub content_hash: String,
    pub archived_to: Option<String>,
    pub rows_seen: usize,
    pub rows_added: usize,
    pub rows_duplicate: usize,
    pub rows_skipped_empty: usize,
    pub rows_failed: usize,
}

#[derive(Debug)]
enum RowOutcome {
    Added(Materialized),
    Duplicate,
    SkippedEmpty,
}

pub struct IngestPipeline {
    feed: Arc<dyn FeedSource>,
    store: Arc<dyn RecordStore>,
    extractor: FieldExtractor,
    archive: Option<SnapshotArchive>,
    run_timeout: Duration,
}

impl IngestPipeline {
    pub fn new(feed: Arc<dyn FeedSource>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            feed,
            store,
            extractor: FieldExtractor::default(),
            archive: None,
            run_timeout: Duration::from_secs(240),
        }
    }

    pub fn from_config(
        config: &IngestConfig,
        feed: Arc<dyn FeedSource>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self> {
        let mut pipeline = Self::new(feed, store)
            .with_extractor(FieldExtractor::new(config.field_aliases()?))
            .with_run_timeout(config.run_timeout);
        if let Some(dir) = &config.archive_dir {
            pipeline = pipeline.with_archive(SnapshotArchive::new(dir.clone()));
        }
        Ok(pipeline)
    }

    pub fn with_extractor(mut self, extractor: FieldExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_archive(mut self, archive: SnapshotArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// One full fetch-parse-dedup-materialize pass, bounded by the run timeout.
    ///
    /// Rows are handled strictly in feed order. Rows committed before an abort
    /// (timeout, malformed stream, cancellation) stay committed.
    pub async fn run_once(&self) -> Result<IngestRunSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, feed = %self.feed.describe());
        match tokio::time::timeout(self.run_timeout, self.run_rows(run_id).instrument(span)).await
        {
            Ok(result) => result,
            Err(_) => Err(IngestError::TimedOut {
                secs: self.run_timeout.as_secs(),
            }),
        }
    }

    async fn run_rows(&self, run_id: Uuid) -> Result<IngestRunSummary, IngestError> {
        let started_at = Utc::now();
        info!("feed ingestion started");

        let snapshot = self.feed.fetch().await?;
        let content_hash = snapshot.content_hash();
        let archived_to = match &self.archive {
            Some(archive) => {
                let archived = archive
                    .archive(&snapshot)
                    .await
                    .map_err(IngestError::Archive)?;
                debug!(path = %archived.path.display(), already_present = archived.already_present, "snapshot archived");
                Some(archived.path.display().to_string())
            }
            None => None,
        };

        let feed_source = snapshot.source.clone();
        let rows = parse_feed(snapshot.body)?;
        debug!(headers = ?rows.headers(), "feed headers");

        let mut dedup = DedupEngine::new();
        let mut summary = IngestRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            feed_source,
            content_hash,
            archived_to,
            rows_seen: 0,
            rows_added: 0,
            rows_duplicate: 0,
            rows_skipped_empty: 0,
            rows_failed: 0,
        };

        for row in rows {
            let row = row?;
            summary.rows_seen += 1;
            match self.ingest_row(&mut dedup, &row).await {
                Ok(RowOutcome::Added(materialized)) => {
                    summary.rows_added += 1;
                    debug!(
                        line = row.line,
                        location_id = %materialized.location_id,
                        person_id = %materialized.person_id,
                        "row imported"
                    );
                }
                Ok(RowOutcome::Duplicate) => summary.rows_duplicate += 1,
                Ok(RowOutcome::SkippedEmpty) => summary.rows_skipped_empty += 1,
                Err(err) => {
                    summary.rows_failed += 1;
                    warn!(line = row.line, raw = %row.raw(), error = %err, "row failed; continuing");
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            rows_seen = summary.rows_seen,
            rows_added = summary.rows_added,
            rows_duplicate = summary.rows_duplicate,
            rows_skipped_empty = summary.rows_skipped_empty,
            rows_failed = summary.rows_failed,
            content_hash = %summary.content_hash,
            "feed ingestion finished"
        );
        Ok(summary)
    }

    async fn ingest_row(
        &self,
        dedup: &mut DedupEngine,
        row: &FeedRow,
    ) -> Result<RowOutcome, RowError> {
        let candidate = match self.extractor.extract(row) {
            Ok(candidate) => candidate,
            Err(warning) => {
                debug!(%warning, "row skipped");
                return Ok(RowOutcome::SkippedEmpty);
            }
        };

        let key = DedupKey::for_candidate(&candidate);
        match &key {
            Some(key) => {
                let decision = dedup
                    .check(self.store.as_ref(), key)
                    .await
                    .map_err(RowError::DedupCheck)?;
                if decision == DedupDecision::Duplicate {
                    debug!(line = row.line, ?key, "duplicate row skipped");
                    return Ok(RowOutcome::Duplicate);
                }
            }
            None => debug!(line = row.line, "row has no identity key; importing as new"),
        }

        let materialized = materialize(self.store.as_ref(), &candidate).await?;
        if let Some(key) = key {
            dedup.record(key);
        }
        Ok(RowOutcome::Added(materialized))
    }
}

// ---------------------------------------------------------------------------
// Run guard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum GuardPhase {
    Idle,
    Running { started_at: DateTime<Utc> },
    CoolingDown { next_available: DateTime<Utc> },
}

/// Rejection returned while a run is in progress or the cooldown window is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownActive {
    pub next_available: DateTime<Utc>,
    pub remaining: Duration,
    pub running: bool,
}

#[derive(Debug, Default)]
struct GuardState {
    last_started: Option<DateTime<Utc>>,
    running: bool,
}

/// Single check-and-set gate shared by every trigger source.
#[derive(Debug)]
pub struct RunGuard {
    cooldown: TimeDelta,
    state: Mutex<GuardState>,
}

impl RunGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::MAX),
            state: Mutex::new(GuardState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn window_end(&self, started: DateTime<Utc>) -> DateTime<Utc> {
        started
            .checked_add_signed(self.cooldown)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn try_acquire(&self) -> Result<RunPermit<'_>, CooldownActive> {
        self.try_acquire_at(Utc::now())
    }

    /// A run is permitted only once more than the cooldown has elapsed since
    /// the last run started, and never while a run is in progress.
    pub fn try_acquire_at(&self, now: DateTime<Utc>) -> Result<RunPermit<'_>, CooldownActive> {
        let mut state = self.lock();
        if let Some(started) = state.last_started {
            let next_available = self.window_end(started);
            if state.running || now <= next_available {
                // a run that outlasts the window is still in flight
                let next_available = next_available.max(now);
                return Err(CooldownActive {
                    next_available,
                    remaining: (next_available - now).to_std().unwrap_or_default(),
                    running: state.running,
                });
            }
        }
        state.last_started = Some(now);
        state.running = true;
        Ok(RunPermit {
            guard: self,
            started_at: now,
            settled: false,
        })
    }

    pub fn phase(&self) -> GuardPhase {
        self.phase_at(Utc::now())
    }

    pub fn phase_at(&self, now: DateTime<Utc>) -> GuardPhase {
        let state = self.lock();
        match state.last_started {
            Some(started_at) if state.running => GuardPhase::Running { started_at },
            Some(started) if now <= self.window_end(started) => GuardPhase::CoolingDown {
                next_available: self.window_end(started),
            },
            _ => GuardPhase::Idle,
        }
    }

    fn settle(&self, lift_cooldown: bool) {
        let mut state = self.lock();
        state.running = false;
        if lift_cooldown {
            state.last_started = None;
        }
    }
}

/// Held for the duration of one run. Dropping it unsettled (cancellation)
/// ends the run but keeps the cooldown.
#[derive(Debug)]
pub struct RunPermit<'a> {
    guard: &'a RunGuard,
    started_at: DateTime<Utc>,
    settled: bool,
}

impl RunPermit<'_> {
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.guard.settle(false);
    }

    /// Lifts the cooldown so the next trigger can retry immediately.
    pub fn fail(mut self) {
        self.settled = true;
        self.guard.settle(true);
    }
}

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.guard.settle(false);
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger surface + scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Startup,
    Timer,
    OnDemand,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Completed {
        summary: IngestRunSummary,
    },
    Skipped {
        reason: String,
        retry_after: DateTime<Utc>,
        remaining_secs: u64,
    },
    Failed {
        error: String,
    },
}

pub struct IngestService {
    pipeline: IngestPipeline,
    guard: RunGuard,
}

impl IngestService {
    pub fn new(pipeline: IngestPipeline, guard: RunGuard) -> Self {
        Self { pipeline, guard }
    }

    pub fn guard(&self) -> &RunGuard {
        &self.guard
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub async fn trigger(&self, source: TriggerSource) -> TriggerOutcome {
        let permit = match self.guard.try_acquire() {
            Ok(permit) => permit,
            Err(cooldown) => {
                info!(
                    ?source,
                    running = cooldown.running,
                    retry_after = %cooldown.next_available,
                    remaining_secs = cooldown.remaining.as_secs(),
                    "ingest trigger skipped; cooldown active"
                );
                return TriggerOutcome::Skipped {
                    reason: "cooldown".to_string(),
                    retry_after: cooldown.next_available,
                    remaining_secs: cooldown.remaining.as_secs(),
                };
            }
        };

        info!(?source, started_at = %permit.started_at(), "ingest trigger accepted");
        match self.pipeline.run_once().await {
            Ok(summary) => {
                permit.succeed();
                TriggerOutcome::Completed { summary }
            }
            Err(err) => {
                error!(?source, error = %err, "ingest run failed; cooldown lifted");
                permit.fail();
                TriggerOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

/// Timer trigger; every tick goes through the same guard as on-demand calls.
pub async fn build_scheduler(service: Arc<IngestService>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            service.trigger(TriggerSource::Timer).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Resolves on Ctrl-C; an in-flight run is abandoned when the runtime shuts down.
pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relief_core::{Location, PersonReport};
    use relief_storage::{FeedSnapshot, StaticFeed};
    use std::collections::HashMap;
    use tempfile::tempdir;

    const HEADER: &str = "Tên,Địa chỉ,Thông tin liên lạc,Khu vực,Ghi chú\n";

    fn feed(rows: &str) -> Arc<dyn FeedSource> {
        Arc::new(StaticFeed::new("test-sheet", format!("{HEADER}{rows}")))
    }

    fn pipeline_over(rows: &str, store: Arc<MemoryStore>) -> IngestPipeline {
        IngestPipeline::new(feed(rows), store)
    }

    struct FailingFeed;

    #[async_trait]
    impl FeedSource for FailingFeed {
        fn describe(&self) -> String {
            "failing".into()
        }

        async fn fetch(&self) -> Result<FeedSnapshot, FetchError> {
            Err(FetchError::HttpStatus {
                status: 503,
                url: "https://sheet.invalid".into(),
            })
        }
    }

    struct SlowFeed;

    #[async_trait]
    impl FeedSource for SlowFeed {
        fn describe(&self) -> String {
            "slow".into()
        }

        async fn fetch(&self) -> Result<FeedSnapshot, FetchError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(FetchError::Timeout {
                url: "https://sheet.invalid".into(),
            })
        }
    }

    /// Delegates to a memory store but refuses person reports for one phone.
    struct FlakyStore {
        inner: MemoryStore,
        reject_phone: String,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn find_one_location(
            &self,
            criteria: &LocationCriteria,
        ) -> Result<Option<Location>, StoreError> {
            self.inner.find_one_location(criteria).await
        }

        async fn find_one_person(
            &self,
            criteria: &PersonCriteria,
        ) -> Result<Option<PersonReport>, StoreError> {
            self.inner.find_one_person(criteria).await
        }

        async fn create_location(&self, new: NewLocation) -> Result<Location, StoreError> {
            self.inner.create_location(new).await
        }

        async fn create_person(&self, new: NewPersonReport) -> Result<PersonReport, StoreError> {
            if new.reporter_phone == self.reject_phone {
                return Err(StoreError::Unavailable("write rejected".into()));
            }
            self.inner.create_person(new).await
        }

        async fn location_by_id(&self, id: Uuid) -> Result<Option<Location>, StoreError> {
            self.inner.location_by_id(id).await
        }

        async fn person_by_id(&self, id: Uuid) -> Result<Option<PersonReport>, StoreError> {
            self.inner.person_by_id(id).await
        }

        async fn update_location_coordinates(
            &self,
            id: Uuid,
            latitude: f64,
            longitude: f64,
        ) -> Result<Location, StoreError> {
            self.inner
                .update_location_coordinates(id, latitude, longitude)
                .await
        }

        async fn update_person_status(
            &self,
            id: Uuid,
            status: PersonStatus,
            found_date: Option<DateTime<Utc>>,
        ) -> Result<PersonReport, StoreError> {
            self.inner.update_person_status(id, status, found_date).await
        }
    }

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts)
            .expect("ts")
            .with_timezone(&Utc)
    }

    async fn seed_location(store: &MemoryStore, address: &str) -> Location {
        store
            .create_location(NewLocation {
                address: Some(address.to_string()),
                ..location_for(&candidate("", address, ""))
            })
            .await
            .expect("seed location")
    }

    fn candidate(phone: &str, address: &str, area: &str) -> CandidateRecord {
        CandidateRecord {
            line: 2,
            name: String::new(),
            address: address.into(),
            phone: phone.into(),
            status_text: String::new(),
            area: area.into(),
            people_count: String::new(),
            note: String::new(),
            description: relief_adapters::composite_description(address, area, "", "", ""),
        }
    }

    #[test]
    fn dedup_key_prefers_long_phones() {
        assert_eq!(
            DedupKey::for_candidate(&candidate("0912345678", "12 Lê Lợi", "")),
            Some(DedupKey::Phone("0912345678".into()))
        );
        assert_eq!(
            DedupKey::for_candidate(&candidate("12345", "12 Lê Lợi", "")),
            Some(DedupKey::Address("12 Lê Lợi".into()))
        );
        assert_eq!(DedupKey::for_candidate(&candidate("", "", "Hòa Vang")), None);
        assert_eq!(DedupKey::for_candidate(&candidate("114", "", "")), None);
    }

    #[tokio::test]
    async fn rows_without_phone_or_address_are_never_merged() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_over(
            "Chi,,113,Hòa Vang,cần nước uống\n\
             Dũng,,114,Hòa Vang,cần thuốc\n\
             ,,,,Gọi không được từ sáng\n\
             ,,,,gọi mãi không ai nghe\n",
            store.clone(),
        );

        let first = pipeline.run_once().await.expect("first run");
        assert_eq!(first.rows_seen, 4);
        assert_eq!(first.rows_added, 4);
        assert_eq!(first.rows_duplicate, 0);
        assert_eq!(store.persons().await.len(), 4);

        // nothing identifies these rows, so a rerun imports them again
        let second = pipeline.run_once().await.expect("second run");
        assert_eq!(second.rows_added, 4);
    }

    #[tokio::test]
    async fn end_to_end_three_rows() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_over(
            "An,Thôn 3,0912345678,Hòa Vang,\n\
             An,Thôn 3 (ghi lại),0912345678,Hòa Vang,\n\
             Bình,123 Main St,,Liên Chiểu,\n",
            store.clone(),
        );

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.rows_seen, 3);
        assert_eq!(summary.rows_added, 2);
        assert_eq!(summary.rows_duplicate, 1);
        assert_eq!(summary.feed_source, "test-sheet");

        let locations = store.locations().await;
        let persons = store.persons().await;
        assert_eq!(locations.len(), 2);
        assert_eq!(persons.len(), 2);

        let by_address: HashMap<_, _> = locations
            .iter()
            .map(|l| (l.address.clone().unwrap_or_default(), l.id))
            .collect();
        let first = persons
            .iter()
            .find(|p| p.reporter_phone == "0912345678")
            .expect("row 1 person");
        assert_eq!(Some(&first.last_known_location), by_address.get("Thôn 3"));
        let third = persons
            .iter()
            .find(|p| p.full_name == "Bình")
            .expect("row 3 person");
        assert_eq!(third.reporter_phone, UNKNOWN_PHONE);
        assert_eq!(Some(&third.last_known_location), by_address.get("123 Main St"));
    }

    #[tokio::test]
    async fn second_run_over_unchanged_feed_adds_nothing() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_over(
            "An,Thôn 3,0912345678,Hòa Vang,\n\
             ,,,,Nhà ở hẻm 5 Lê Lợi. liên hệ: 0901 234 567\n\
             Bình,12 Lê Lợi,0123,Liên Chiểu,\n\
             ,,,,cần thuyền gấp\n",
            store.clone(),
        );

        let first = pipeline.run_once().await.expect("first run");
        assert_eq!(first.rows_added, 4);
        let locations_after_first = store.locations().await;
        let persons_after_first = store.persons().await;

        let second = pipeline.run_once().await.expect("second run");
        assert_eq!(second.rows_seen, 4);
        assert_eq!(second.rows_added, 0);
        assert_eq!(second.rows_duplicate, 4);
        assert_eq!(store.locations().await, locations_after_first);
        assert_eq!(store.persons().await, persons_after_first);
        assert_eq!(first.content_hash, second.content_hash);
    }

    #[tokio::test]
    async fn existing_ingested_phone_is_a_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let location = seed_location(&store, "somewhere else").await;
        store
            .create_person(person_for(
                &candidate("0912345678", "somewhere else", ""),
                location.id,
                Utc::now(),
            ))
            .await
            .expect("seed person");

        let pipeline = pipeline_over("An,Địa chỉ mới,0912345678,,\n", store.clone());
        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.rows_duplicate, 1);
        assert_eq!(summary.rows_added, 0);
        assert_eq!(store.persons().await.len(), 1);
    }

    #[tokio::test]
    async fn user_submitted_report_with_same_phone_is_not_a_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let location = seed_location(&store, "web form address").await;
        store
            .create_person(NewPersonReport {
                reporter_name: "Người nhà".into(),
                description: "Mất liên lạc từ tối qua".into(),
                status: PersonStatus::Missing,
                verification_status: VerificationStatus::Pending,
                ..person_for(&candidate("0912345678", "", ""), location.id, Utc::now())
            })
            .await
            .expect("seed person");

        let pipeline = pipeline_over("An,Thôn 3,0912345678,,\n", store.clone());
        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.rows_added, 1);
        assert_eq!(store.persons().await.len(), 2);
    }

    #[tokio::test]
    async fn address_only_row_matches_existing_ingested_location() {
        let store = Arc::new(MemoryStore::new());
        seed_location(&store, "123 Main St").await;

        let engine = DedupEngine::new();
        let decision = engine
            .check(
                &*store,
                &DedupKey::Address("123 Main St".into()),
            )
            .await
            .expect("check");
        assert_eq!(decision, DedupDecision::Duplicate);

        let pipeline = pipeline_over("Chi,123 Main St,,,\n", store.clone());
        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.rows_duplicate, 1);
        assert_eq!(store.locations().await.len(), 1);
    }

    #[tokio::test]
    async fn address_match_ignores_other_location_kinds() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_location(NewLocation {
                location_type: LocationType::ResourcePoint,
                ..location_for(&candidate("", "123 Main St", ""))
            })
            .await
            .expect("seed");

        let pipeline = pipeline_over("Chi,123 Main St,,,\n", store.clone());
        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.rows_added, 1);
    }

    #[tokio::test]
    async fn empty_rows_are_counted_but_never_written() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_over("An,,,Hòa Vang,\n,,,,\n", store.clone());
        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.rows_seen, 2);
        assert_eq!(summary.rows_skipped_empty, 2);
        assert_eq!(summary.rows_added, 0);
        assert!(store.locations().await.is_empty());
        assert!(store.persons().await.is_empty());
    }

    #[tokio::test]
    async fn materialized_records_carry_ingestion_defaults() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_over(",,,Hòa Vang,Nhà ở hẻm 5 Lê Lợi. liên hệ: 0901 234 567\n", store.clone());
        pipeline.run_once().await.expect("run");

        let location = store.locations().await.pop().expect("location");
        assert!(location.awaiting_geocode());
        assert_eq!(location.address.as_deref(), Some("Nhà ở hẻm 5 Lê Lợi."));
        assert_eq!(location.district.as_deref(), Some("Hòa Vang"));
        assert_eq!(location.location_type, LocationType::UserLocation);
        assert_eq!(location.status, LocationStatus::Active);
        assert_eq!(location.reporter_name.as_deref(), Some(INGEST_REPORTER_NAME));
        assert_eq!(
            location.description.as_deref(),
            Some("Imported from Sheet. Area: Hòa Vang")
        );

        let person = store.persons().await.pop().expect("person");
        assert_eq!(person.last_known_location, location.id);
        assert_eq!(person.reporter_phone, "0901234567");
        assert_eq!(person.contact_info, "0901234567");
        assert_eq!(person.full_name, UNKNOWN_NAME);
        assert_eq!(person.gender, Gender::Unknown);
        assert_eq!(person.status, PersonStatus::NeedHelp);
        assert_eq!(person.verification_status, VerificationStatus::Unverified);
        assert!(relief_core::has_ingest_marker(&person.description));
        assert!(person.description.contains("Ghi chú gốc: Nhà ở hẻm 5"));
    }

    #[tokio::test]
    async fn a_failed_row_write_does_not_abort_the_run() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            reject_phone: "0911111111".into(),
        });
        let pipeline = IngestPipeline::new(
            feed("An,Thôn 1,0911111111,,\nBình,Thôn 2,0922222222,,\n"),
            store.clone(),
        );

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.rows_seen, 2);
        assert_eq!(summary.rows_failed, 1);
        assert_eq!(summary.rows_added, 1);
        // the first row's location is left behind
        assert_eq!(store.inner.locations().await.len(), 2);
        assert_eq!(store.inner.persons().await.len(), 1);
    }

    #[tokio::test]
    async fn orphaned_location_is_reported_on_partial_write() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            reject_phone: "0911111111".into(),
        };
        let err = materialize(&store, &candidate("0911111111", "Thôn 1", ""))
            .await
            .expect_err("person write rejected");
        match err {
            RowError::StoreWrite {
                orphan_location: Some(id),
                ..
            } => assert!(store.inner.location_by_id(id).await.expect("get").is_some()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_stream_aborts_after_committing_earlier_rows() {
        let store = Arc::new(MemoryStore::new());
        let mut body = HEADER.as_bytes().to_vec();
        body.extend_from_slice("An,Thôn 1,0911111111,,\n".as_bytes());
        body.extend_from_slice(b"Binh,\xff\xfe,,,\n");
        let pipeline = IngestPipeline::new(Arc::new(StaticFeed::new("bad", body)), store.clone());

        let err = pipeline.run_once().await.expect_err("parse error");
        assert!(matches!(err, IngestError::Parse(_)));
        assert_eq!(store.persons().await.len(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_the_run() {
        let pipeline = IngestPipeline::new(Arc::new(FailingFeed), Arc::new(MemoryStore::new()));
        let err = pipeline.run_once().await.expect_err("fetch error");
        assert!(matches!(
            err,
            IngestError::Fetch(FetchError::HttpStatus { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn runs_are_bounded_by_the_timeout() {
        let pipeline = IngestPipeline::new(Arc::new(SlowFeed), Arc::new(MemoryStore::new()))
            .with_run_timeout(Duration::from_millis(50));
        let err = pipeline.run_once().await.expect_err("timeout");
        assert!(matches!(err, IngestError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn snapshots_are_archived_when_configured() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline_over("An,Thôn 3,0912345678,,\n", Arc::new(MemoryStore::new()))
            .with_archive(SnapshotArchive::new(dir.path()));
        let summary = pipeline.run_once().await.expect("run");
        let archived = summary.archived_to.expect("archive path");
        assert!(archived.ends_with(&format!("{}.csv", summary.content_hash)));
        assert!(std::path::Path::new(&archived).exists());
    }

    #[test]
    fn second_trigger_inside_window_is_rejected_with_stable_retry_time() {
        let guard = RunGuard::new(Duration::from_secs(600));
        let start = at("2026-10-15T08:00:00Z");

        let permit = guard.try_acquire_at(start).expect("first run");
        permit.succeed();

        let first = guard
            .try_acquire_at(at("2026-10-15T08:01:00Z"))
            .expect_err("cooldown");
        let second = guard
            .try_acquire_at(at("2026-10-15T08:05:00Z"))
            .expect_err("cooldown");
        assert_eq!(first.next_available, at("2026-10-15T08:10:00Z"));
        assert_eq!(first.next_available, second.next_available);
        assert_eq!(first.remaining, Duration::from_secs(540));
        assert!(!first.running);

        assert!(guard.try_acquire_at(at("2026-10-15T08:10:01Z")).is_ok());
    }

    #[test]
    fn trigger_while_running_is_rejected() {
        let guard = RunGuard::new(Duration::from_secs(60));
        let start = at("2026-10-15T08:00:00Z");
        let permit = guard.try_acquire_at(start).expect("first run");

        let late = at("2026-10-15T08:30:00Z");
        let rejected = guard.try_acquire_at(late).expect_err("still running");
        assert!(rejected.running);
        assert_eq!(guard.phase_at(late), GuardPhase::Running { started_at: start });

        permit.succeed();
        assert_eq!(guard.phase_at(late), GuardPhase::Idle);
    }

    #[test]
    fn run_outlasting_the_window_never_reports_a_past_retry_time() {
        let guard = RunGuard::new(Duration::from_secs(60));
        let _permit = guard
            .try_acquire_at(at("2026-10-15T08:00:00Z"))
            .expect("first run");

        let late = at("2026-10-15T08:30:00Z");
        let rejected = guard.try_acquire_at(late).expect_err("still running");
        assert!(rejected.running);
        assert_eq!(rejected.next_available, late);
        assert_eq!(rejected.remaining, Duration::ZERO);
    }

    #[tokio::test]
    async fn keys_recorded_this_run_are_duplicates_without_a_store_match() {
        let store = MemoryStore::new();
        let key = DedupKey::Phone("0912345678".into());
        let mut engine = DedupEngine::new();
        assert_eq!(
            engine.check(&store, &key).await.expect("check"),
            DedupDecision::New
        );

        engine.record(key.clone());
        assert_eq!(
            engine.check(&store, &key).await.expect("check"),
            DedupDecision::Duplicate
        );
        assert_eq!(
            engine
                .check(&store, &DedupKey::Address("12 Lê Lợi".into()))
                .await
                .expect("check"),
            DedupDecision::New
        );
        assert_eq!(engine.created_this_run(), 1);
    }

    #[test]
    fn failure_lifts_the_cooldown() {
        let guard = RunGuard::new(Duration::from_secs(600));
        let start = at("2026-10-15T08:00:00Z");
        guard.try_acquire_at(start).expect("first run").fail();

        assert_eq!(guard.phase_at(start), GuardPhase::Idle);
        assert!(guard.try_acquire_at(at("2026-10-15T08:00:01Z")).is_ok());
    }

    #[test]
    fn abandoned_run_keeps_the_cooldown() {
        let guard = RunGuard::new(Duration::from_secs(600));
        let start = at("2026-10-15T08:00:00Z");
        drop(guard.try_acquire_at(start).expect("first run"));

        assert_eq!(
            guard.phase_at(at("2026-10-15T08:01:00Z")),
            GuardPhase::CoolingDown {
                next_available: at("2026-10-15T08:10:00Z")
            }
        );
    }

    #[test]
    fn concurrent_triggers_admit_exactly_one_run() {
        let guard = RunGuard::new(Duration::from_secs(600));
        let admitted = std::thread::scope(|scope| {
            let handles = (0..8)
                .map(|_| {
                    scope.spawn(|| match guard.try_acquire() {
                        // keep the run open so the others observe it
                        Ok(permit) => {
                            std::mem::forget(permit);
                            1
                        }
                        Err(_) => 0,
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().expect("thread"))
                .sum::<usize>()
        });
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn service_runs_once_then_reports_cooldown() {
        let store = Arc::new(MemoryStore::new());
        let service = IngestService::new(
            pipeline_over("An,Thôn 3,0912345678,,\n", store.clone()),
            RunGuard::new(Duration::from_secs(600)),
        );

        let first = service.trigger(TriggerSource::OnDemand).await;
        assert!(matches!(first, TriggerOutcome::Completed { ref summary } if summary.rows_added == 1));

        let second = service.trigger(TriggerSource::Timer).await;
        let third = service.trigger(TriggerSource::OnDemand).await;
        match (second, third) {
            (
                TriggerOutcome::Skipped { retry_after: a, reason, .. },
                TriggerOutcome::Skipped { retry_after: b, .. },
            ) => {
                assert_eq!(reason, "cooldown");
                assert_eq!(a, b);
            }
            other => panic!("expected two skips, got {other:?}"),
        }
        assert_eq!(store.persons().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_run_allows_an_immediate_retry() {
        let service = IngestService::new(
            IngestPipeline::new(Arc::new(FailingFeed), Arc::new(MemoryStore::new())),
            RunGuard::new(Duration::from_secs(600)),
        );

        let first = service.trigger(TriggerSource::OnDemand).await;
        assert!(matches!(first, TriggerOutcome::Failed { ref error } if error.contains("503")));
        let second = service.trigger(TriggerSource::OnDemand).await;
        assert!(matches!(second, TriggerOutcome::Failed { .. }));
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = IngestConfig::default();
        assert_eq!(defaults.feed_url, DEFAULT_FEED_URL);
        assert!(defaults.database_url.is_none());
        assert!(defaults.scheduler_enabled);
        assert_eq!(defaults.cooldown, Duration::from_secs(300));
        assert_eq!(defaults.sync_cron, "0 */10 * * * *");

        let env: HashMap<&str, &str> = HashMap::from([
            ("RELIEF_FEED_URL", "https://example.org/feed.csv"),
            ("DATABASE_URL", ""),
            ("RELIEF_SCHEDULER_ENABLED", "false"),
            ("RELIEF_COOLDOWN_SECS", "60"),
            ("RELIEF_RUN_TIMEOUT_SECS", "not-a-number"),
            ("RELIEF_ARCHIVE_DIR", "/var/lib/relief/archive"),
        ]);
        let config = IngestConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.feed_url, "https://example.org/feed.csv");
        assert!(config.database_url.is_none());
        assert!(!config.scheduler_enabled);
        assert_eq!(config.cooldown, Duration::from_secs(60));
        assert_eq!(config.run_timeout, Duration::from_secs(240));
        assert_eq!(
            config.archive_dir,
            Some(PathBuf::from("/var/lib/relief/archive"))
        );
    }

    #[test]
    fn trigger_outcomes_serialize_with_a_status_tag() {
        let skipped = TriggerOutcome::Skipped {
            reason: "cooldown".into(),
            retry_after: at("2026-10-15T08:10:00Z"),
            remaining_secs: 42,
        };
        let value = serde_json::to_value(&skipped).expect("json");
        assert_eq!(value["status"], "skipped");
        assert_eq!(value["reason"], "cooldown");
        assert_eq!(value["remaining_secs"], 42);
    }
}
