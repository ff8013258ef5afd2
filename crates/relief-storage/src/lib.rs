//! Feed fetching, snapshot archiving, and the record store collaborator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relief_core::{
    Gender, Location, LocationStatus, LocationType, NewLocation, NewPersonReport, PersonReport,
    PersonStatus, VerificationStatus,
};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "relief-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Feed fetching
// ---------------------------------------------------------------------------

/// One raw snapshot of the external feed.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

impl FeedSnapshot {
    pub fn content_hash(&self) -> String {
        sha256_hex(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading feed file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that can hand the pipeline a snapshot of the feed.
///
/// Implementations never retry; a failure surfaces to the caller, which waits
/// for the next scheduled attempt.
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<FeedSnapshot, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFeedFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpFeedFetcher {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: self.url.clone(),
            }
        } else {
            FetchError::Request {
                url: self.url.clone(),
                source: err,
            }
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedFetcher {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<FeedSnapshot, FetchError> {
        let span = info_span!("feed_fetch", url = %self.url);
        async move {
            let resp = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| self.request_error(e))?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await.map_err(|e| self.request_error(e))?.to_vec();
            debug!(bytes = body.len(), %final_url, "feed fetched");
            Ok(FeedSnapshot {
                source: final_url,
                fetched_at: Utc::now(),
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Reads the feed from a local CSV export.
#[derive(Debug, Clone)]
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedSource for FileFeed {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<FeedSnapshot, FetchError> {
        let body = fs::read(&self.path).await.map_err(|source| FetchError::File {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(FeedSnapshot {
            source: self.describe(),
            fetched_at: Utc::now(),
            body,
        })
    }
}

/// Serves the same in-memory body on every fetch.
#[derive(Debug, Clone)]
pub struct StaticFeed {
    name: String,
    body: Vec<u8>,
}

impl StaticFeed {
    pub fn new(name: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

#[async_trait]
impl FeedSource for StaticFeed {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn fetch(&self) -> Result<FeedSnapshot, FetchError> {
        Ok(FeedSnapshot {
            source: self.name.clone(),
            fetched_at: Utc::now(),
            body: self.body.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Snapshot archive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub path: PathBuf,
    pub already_present: bool,
}

/// Keeps raw feed snapshots on disk, one file per distinct body per day.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, fetched_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        self.root
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(format!("{content_hash}.csv"))
    }

    /// Writes through a temp file in the target directory, then renames into place.
    pub async fn archive(&self, snapshot: &FeedSnapshot) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = snapshot.content_hash();
        let path = self.snapshot_path(snapshot.fetched_at, &content_hash);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking archive path {}", path.display()))?
        {
            return Ok(ArchivedSnapshot {
                content_hash,
                path,
                already_present: true,
            });
        }

        let temp_path = dir.join(format!(".{}.part", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating {}", temp_path.display()))?;
        file.write_all(&snapshot.body)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("moving snapshot into {}", path.display()));
        }

        Ok(ArchivedSnapshot {
            content_hash,
            path,
            already_present: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Record store collaborator
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("corrupt {entity} row: {reason}")]
    Corrupt { entity: &'static str, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// `find_one` criteria for locations; `None` fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationCriteria {
    pub address: Option<String>,
    pub location_type: Option<LocationType>,
}

impl LocationCriteria {
    pub fn matches(&self, location: &Location) -> bool {
        self.address
            .as_deref()
            .map_or(true, |address| location.address.as_deref() == Some(address))
            && self
                .location_type
                .map_or(true, |kind| location.location_type == kind)
    }
}

/// `find_one` criteria for person reports. `description_contains` is case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonCriteria {
    pub reporter_phone: Option<String>,
    pub description_contains: Option<String>,
}

impl PersonCriteria {
    pub fn matches(&self, person: &PersonReport) -> bool {
        self.reporter_phone
            .as_deref()
            .map_or(true, |phone| person.reporter_phone == phone)
            && self.description_contains.as_deref().map_or(true, |needle| {
                person
                    .description
                    .to_lowercase()
                    .contains(&needle.to_lowercase())
            })
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_one_location(
        &self,
        criteria: &LocationCriteria,
    ) -> Result<Option<Location>, StoreError>;

    async fn find_one_person(
        &self,
        criteria: &PersonCriteria,
    ) -> Result<Option<PersonReport>, StoreError>;

    async fn create_location(&self, new: NewLocation) -> Result<Location, StoreError>;

    /// Fails with [`StoreError::NotFound`] when the referenced location does not exist.
    async fn create_person(&self, new: NewPersonReport) -> Result<PersonReport, StoreError>;

    async fn location_by_id(&self, id: Uuid) -> Result<Option<Location>, StoreError>;

    async fn person_by_id(&self, id: Uuid) -> Result<Option<PersonReport>, StoreError>;

    /// Geocoding correction applied by an external workflow.
    async fn update_location_coordinates(
        &self,
        id: Uuid,
        latitude: f64,
        longitude: f64,
    ) -> Result<Location, StoreError>;

    async fn update_person_status(
        &self,
        id: Uuid,
        status: PersonStatus,
        found_date: Option<DateTime<Utc>>,
    ) -> Result<PersonReport, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryTables {
    locations: Vec<Location>,
    persons: Vec<PersonReport>,
}

/// Process-local store used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn locations(&self) -> Vec<Location> {
        self.tables.read().await.locations.clone()
    }

    pub async fn persons(&self) -> Vec<PersonReport> {
        self.tables.read().await.persons.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_one_location(
        &self,
        criteria: &LocationCriteria,
    ) -> Result<Option<Location>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .locations
            .iter()
            .find(|l| criteria.matches(l))
            .cloned())
    }

    async fn find_one_person(
        &self,
        criteria: &PersonCriteria,
    ) -> Result<Option<PersonReport>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.persons.iter().find(|p| criteria.matches(p)).cloned())
    }

    async fn create_location(&self, new: NewLocation) -> Result<Location, StoreError> {
        let location = new.into_location(Uuid::new_v4(), Utc::now());
        self.tables.write().await.locations.push(location.clone());
        Ok(location)
    }

    async fn create_person(&self, new: NewPersonReport) -> Result<PersonReport, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables
            .locations
            .iter()
            .any(|l| l.id == new.last_known_location)
        {
            return Err(StoreError::NotFound {
                entity: "location",
                id: new.last_known_location,
            });
        }
        let person = new.into_report(Uuid::new_v4(), Utc::now());
        tables.persons.push(person.clone());
        Ok(person)
    }

    async fn location_by_id(&self, id: Uuid) -> Result<Option<Location>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.locations.iter().find(|l| l.id == id).cloned())
    }

    async fn person_by_id(&self, id: Uuid) -> Result<Option<PersonReport>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.persons.iter().find(|p| p.id == id).cloned())
    }

    async fn update_location_coordinates(
        &self,
        id: Uuid,
        latitude: f64,
        longitude: f64,
    ) -> Result<Location, StoreError> {
        let mut tables = self.tables.write().await;
        let location = tables
            .locations
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(StoreError::NotFound {
                entity: "location",
                id,
            })?;
        location.latitude = latitude;
        location.longitude = longitude;
        location.updated_at = Utc::now();
        Ok(location.clone())
    }

    async fn update_person_status(
        &self,
        id: Uuid,
        status: PersonStatus,
        found_date: Option<DateTime<Utc>>,
    ) -> Result<PersonReport, StoreError> {
        let mut tables = self.tables.write().await;
        let person = tables
            .persons
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(StoreError::NotFound {
                entity: "person report",
                id,
            })?;
        person.status = status;
        person.found_date = found_date;
        person.updated_at = Utc::now();
        Ok(person.clone())
    }
}

const LOCATION_COLUMNS: &str = "id, latitude, longitude, address, province, district, ward, \
     street, location_type, description, reporter_name, status, capacity, current_count, \
     photo_urls, created_at, updated_at";

const PERSON_COLUMNS: &str = "id, reporter_name, reporter_phone, full_name, age, gender, \
     photo_urls, description, last_known_location, last_seen_date, contact_info, status, \
     found_date, verification_status, created_at, updated_at";

/// Postgres-backed store; schema lives in the workspace `migrations/` directory.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")
    }
}

fn parse_text_enum<T>(
    row: &PgRow,
    column: &str,
    entity: &'static str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    parse(&raw).ok_or_else(|| StoreError::Corrupt {
        entity,
        reason: format!("unknown {column} value {raw:?}"),
    })
}

fn location_from_row(row: &PgRow) -> Result<Location, StoreError> {
    Ok(Location {
        id: row.try_get("id")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        address: row.try_get("address")?,
        province: row.try_get("province")?,
        district: row.try_get("district")?,
        ward: row.try_get("ward")?,
        street: row.try_get("street")?,
        location_type: parse_text_enum(row, "location_type", "location", LocationType::parse)?,
        description: row.try_get("description")?,
        reporter_name: row.try_get("reporter_name")?,
        status: parse_text_enum(row, "status", "location", LocationStatus::parse)?,
        capacity: row.try_get("capacity")?,
        current_count: row.try_get("current_count")?,
        photo_urls: row.try_get("photo_urls")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn person_from_row(row: &PgRow) -> Result<PersonReport, StoreError> {
    let age: Option<i32> = row.try_get("age")?;
    let age = age
        .map(u32::try_from)
        .transpose()
        .map_err(|_| StoreError::Corrupt {
            entity: "person report",
            reason: "negative age".to_string(),
        })?;
    Ok(PersonReport {
        id: row.try_get("id")?,
        reporter_name: row.try_get("reporter_name")?,
        reporter_phone: row.try_get("reporter_phone")?,
        full_name: row.try_get("full_name")?,
        age,
        gender: parse_text_enum(row, "gender", "person report", Gender::parse)?,
        photo_urls: row.try_get("photo_urls")?,
        description: row.try_get("description")?,
        last_known_location: row.try_get("last_known_location")?,
        last_seen_date: row.try_get("last_seen_date")?,
        contact_info: row.try_get("contact_info")?,
        status: parse_text_enum(row, "status", "person report", PersonStatus::parse)?,
        found_date: row.try_get("found_date")?,
        verification_status: parse_text_enum(
            row,
            "verification_status",
            "person report",
            VerificationStatus::parse,
        )?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RecordStore for PgStore {
    async fn find_one_location(
        &self,
        criteria: &LocationCriteria,
    ) -> Result<Option<Location>, StoreError> {
        let sql = format!(
            r#"
            SELECT {LOCATION_COLUMNS}
              FROM locations
             WHERE ($1::text IS NULL OR address = $1)
               AND ($2::text IS NULL OR location_type = $2)
             ORDER BY created_at
             LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(criteria.address.as_deref())
            .bind(criteria.location_type.map(|t| t.as_str()))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn find_one_person(
        &self,
        criteria: &PersonCriteria,
    ) -> Result<Option<PersonReport>, StoreError> {
        let sql = format!(
            r#"
            SELECT {PERSON_COLUMNS}
              FROM missing_persons
             WHERE ($1::text IS NULL OR reporter_phone = $1)
               AND ($2::text IS NULL OR strpos(lower(description), lower($2)) > 0)
             ORDER BY created_at
             LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(criteria.reporter_phone.as_deref())
            .bind(criteria.description_contains.as_deref())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(person_from_row).transpose()
    }

    async fn create_location(&self, new: NewLocation) -> Result<Location, StoreError> {
        let location = new.into_location(Uuid::new_v4(), Utc::now());
        let sql = format!(
            "INSERT INTO locations ({LOCATION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        );
        sqlx::query(&sql)
            .bind(location.id)
            .bind(location.latitude)
            .bind(location.longitude)
            .bind(location.address.as_deref())
            .bind(location.province.as_deref())
            .bind(location.district.as_deref())
            .bind(location.ward.as_deref())
            .bind(location.street.as_deref())
            .bind(location.location_type.as_str())
            .bind(location.description.as_deref())
            .bind(location.reporter_name.as_deref())
            .bind(location.status.as_str())
            .bind(location.capacity)
            .bind(location.current_count)
            .bind(&location.photo_urls)
            .bind(location.created_at)
            .bind(location.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(location)
    }

    async fn create_person(&self, new: NewPersonReport) -> Result<PersonReport, StoreError> {
        let person = new.into_report(Uuid::new_v4(), Utc::now());
        let age = person
            .age
            .map(i32::try_from)
            .transpose()
            .map_err(|_| StoreError::Corrupt {
                entity: "person report",
                reason: "age out of range".to_string(),
            })?;
        let sql = format!(
            "INSERT INTO missing_persons ({PERSON_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        );
        let result = sqlx::query(&sql)
            .bind(person.id)
            .bind(&person.reporter_name)
            .bind(&person.reporter_phone)
            .bind(&person.full_name)
            .bind(age)
            .bind(person.gender.as_str())
            .bind(&person.photo_urls)
            .bind(&person.description)
            .bind(person.last_known_location)
            .bind(person.last_seen_date)
            .bind(&person.contact_info)
            .bind(person.status.as_str())
            .bind(person.found_date)
            .bind(person.verification_status.as_str())
            .bind(person.created_at)
            .bind(person.updated_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(person),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(StoreError::NotFound {
                    entity: "location",
                    id: person.last_known_location,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn location_by_id(&self, id: Uuid) -> Result<Option<Location>, StoreError> {
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn person_by_id(&self, id: Uuid) -> Result<Option<PersonReport>, StoreError> {
        let sql = format!("SELECT {PERSON_COLUMNS} FROM missing_persons WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(person_from_row).transpose()
    }

    async fn update_location_coordinates(
        &self,
        id: Uuid,
        latitude: f64,
        longitude: f64,
    ) -> Result<Location, StoreError> {
        let sql = format!(
            r#"
            UPDATE locations
               SET latitude = $2,
                   longitude = $3,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {LOCATION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(latitude)
            .bind(longitude)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "location",
                id,
            })?;
        location_from_row(&row)
    }

    async fn update_person_status(
        &self,
        id: Uuid,
        status: PersonStatus,
        found_date: Option<DateTime<Utc>>,
    ) -> Result<PersonReport, StoreError> {
        let sql = format!(
            r#"
            UPDATE missing_persons
               SET status = $2,
                   found_date = $3,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {PERSON_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(found_date)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "person report",
                id,
            })?;
        person_from_row(&row)
    }
}
