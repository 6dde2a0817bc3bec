//! Transactional store facade, raw artifact storage and HTTP fetch utilities
//! for Geekrank.
//!
//! A reconciliation run opens exactly one [`GameStore`] through a
//! [`StoreBackend`], performs every read and write through it, and then
//! commits once or rolls the whole run back. Reads observe the run's own
//! uncommitted writes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geekrank_core::{GameRecord, TaxonomyKind};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "geekrank-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// One open run transaction against the relational store.
///
/// `replace_game` rewrites every scalar field of an existing row from the
/// given record but never touches `old_rank`; rank history moves only through
/// `set_old_rank`.
#[async_trait]
pub trait GameStore: Send {
    async fn game_exists(&mut self, id: i64) -> Result<bool, StoreError>;
    async fn fetch_game(&mut self, id: i64) -> Result<Option<GameRecord>, StoreError>;
    async fn insert_game(&mut self, record: &GameRecord) -> Result<(), StoreError>;
    async fn replace_game(&mut self, record: &GameRecord) -> Result<(), StoreError>;
    async fn set_old_rank(&mut self, id: i64, old_rank: Option<i32>) -> Result<(), StoreError>;
    async fn upsert_description(&mut self, id: i64, text: &str) -> Result<(), StoreError>;

    /// Prior-run rank per game id, taken before the rank table is cleared.
    async fn rank_snapshot(&mut self) -> Result<HashMap<i64, i32>, StoreError>;
    async fn clear_ranks(&mut self) -> Result<(), StoreError>;
    async fn insert_rank(&mut self, id: i64, rank: i32) -> Result<(), StoreError>;

    /// Ids whose recorded `old_rank` is non-null and strictly less than the
    /// rank assigned in this run, in current rank order.
    async fn promoted_ids(&mut self) -> Result<Vec<i64>, StoreError>;
    /// Delete every game without a rank entry; returns the number removed.
    async fn purge_unranked(&mut self) -> Result<u64, StoreError>;

    async fn find_entity(
        &mut self,
        kind: TaxonomyKind,
        name: &str,
    ) -> Result<Option<i64>, StoreError>;
    /// Insert a taxonomy entity and return its generated identifier.
    async fn insert_entity(&mut self, kind: TaxonomyKind, name: &str) -> Result<i64, StoreError>;
    async fn link_exists(
        &mut self,
        game_id: i64,
        kind: TaxonomyKind,
        entity_id: i64,
    ) -> Result<bool, StoreError>;
    async fn insert_link(
        &mut self,
        game_id: i64,
        kind: TaxonomyKind,
        entity_id: i64,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn GameStore>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct MemoryState {
    games: BTreeMap<i64, GameRecord>,
    descriptions: BTreeMap<i64, String>,
    ranks: BTreeMap<i64, i32>,
    entities: BTreeMap<(TaxonomyKind, i64), String>,
    links: BTreeSet<(TaxonomyKind, i64, i64)>,
    next_entity_id: i64,
}

/// Staged-clone store used by tests and offline runs. `begin` clones the
/// committed state; `commit` swaps the staged copy back in.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn begin(&self) -> Result<Box<dyn GameStore>, StoreError> {
        let staged = self.state.lock().await.clone();
        Ok(Box::new(MemoryStore {
            base: self.state.clone(),
            staged,
        }))
    }
}

pub struct MemoryStore {
    base: Arc<Mutex<MemoryState>>,
    staged: MemoryState,
}

#[async_trait]
impl GameStore for MemoryStore {
    async fn game_exists(&mut self, id: i64) -> Result<bool, StoreError> {
        Ok(self.staged.games.contains_key(&id))
    }

    async fn fetch_game(&mut self, id: i64) -> Result<Option<GameRecord>, StoreError> {
        Ok(self.staged.games.get(&id).cloned())
    }

    async fn insert_game(&mut self, record: &GameRecord) -> Result<(), StoreError> {
        if self.staged.games.contains_key(&record.id) {
            return Err(StoreError::Constraint(format!(
                "game {} already exists",
                record.id
            )));
        }
        self.staged.games.insert(record.id, record.clone());
        Ok(())
    }

    async fn replace_game(&mut self, record: &GameRecord) -> Result<(), StoreError> {
        let existing = self.staged.games.get_mut(&record.id).ok_or_else(|| {
            StoreError::Constraint(format!("game {} does not exist", record.id))
        })?;
        let old_rank = existing.old_rank;
        *existing = record.clone();
        existing.old_rank = old_rank;
        Ok(())
    }

    async fn set_old_rank(&mut self, id: i64, old_rank: Option<i32>) -> Result<(), StoreError> {
        let existing = self
            .staged
            .games
            .get_mut(&id)
            .ok_or_else(|| StoreError::Constraint(format!("game {id} does not exist")))?;
        existing.old_rank = old_rank;
        Ok(())
    }

    async fn upsert_description(&mut self, id: i64, text: &str) -> Result<(), StoreError> {
        self.staged.descriptions.insert(id, text.to_string());
        Ok(())
    }

    async fn rank_snapshot(&mut self) -> Result<HashMap<i64, i32>, StoreError> {
        Ok(self.staged.ranks.iter().map(|(k, v)| (*k, *v)).collect())
    }

    async fn clear_ranks(&mut self) -> Result<(), StoreError> {
        self.staged.ranks.clear();
        Ok(())
    }

    async fn insert_rank(&mut self, id: i64, rank: i32) -> Result<(), StoreError> {
        if self.staged.ranks.contains_key(&id) {
            return Err(StoreError::Constraint(format!("game {id} already ranked")));
        }
        if self.staged.ranks.values().any(|r| *r == rank) {
            return Err(StoreError::Constraint(format!("rank {rank} already taken")));
        }
        self.staged.ranks.insert(id, rank);
        Ok(())
    }

    async fn promoted_ids(&mut self) -> Result<Vec<i64>, StoreError> {
        let mut promoted: Vec<(i32, i64)> = self
            .staged
            .ranks
            .iter()
            .filter_map(|(id, rank)| {
                let game = self.staged.games.get(id)?;
                match game.old_rank {
                    Some(old) if old < *rank => Some((*rank, *id)),
                    _ => None,
                }
            })
            .collect();
        promoted.sort();
        Ok(promoted.into_iter().map(|(_, id)| id).collect())
    }

    async fn purge_unranked(&mut self) -> Result<u64, StoreError> {
        let doomed: Vec<i64> = self
            .staged
            .games
            .keys()
            .filter(|id| !self.staged.ranks.contains_key(id))
            .copied()
            .collect();
        for id in &doomed {
            self.staged.games.remove(id);
            self.staged.descriptions.remove(id);
            self.staged
                .links
                .retain(|(_, game_id, _)| game_id != id);
        }
        Ok(doomed.len() as u64)
    }

    async fn find_entity(
        &mut self,
        kind: TaxonomyKind,
        name: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .staged
            .entities
            .iter()
            .find(|((k, _), n)| *k == kind && n.as_str() == name)
            .map(|((_, id), _)| *id))
    }

    async fn insert_entity(&mut self, kind: TaxonomyKind, name: &str) -> Result<i64, StoreError> {
        if self.find_entity(kind, name).await?.is_some() {
            return Err(StoreError::Constraint(format!(
                "duplicate {} name: {name}",
                kind.as_str()
            )));
        }
        self.staged.next_entity_id += 1;
        let id = self.staged.next_entity_id;
        self.staged.entities.insert((kind, id), name.to_string());
        Ok(id)
    }

    async fn link_exists(
        &mut self,
        game_id: i64,
        kind: TaxonomyKind,
        entity_id: i64,
    ) -> Result<bool, StoreError> {
        Ok(self.staged.links.contains(&(kind, game_id, entity_id)))
    }

    async fn insert_link(
        &mut self,
        game_id: i64,
        kind: TaxonomyKind,
        entity_id: i64,
    ) -> Result<(), StoreError> {
        if !self.staged.links.insert((kind, game_id, entity_id)) {
            return Err(StoreError::Constraint(format!(
                "duplicate {} link for game {game_id}",
                kind.as_str()
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        *self.base.lock().await = self.staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        info!("connected to store");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for PgBackend {
    async fn begin(&self) -> Result<Box<dyn GameStore>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStore { tx }))
    }
}

fn join_table(kind: TaxonomyKind) -> String {
    format!("board_game_has_{}", kind.as_str())
}

fn join_column(kind: TaxonomyKind) -> String {
    format!("{}_id", kind.as_str())
}

pub struct PgStore {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl GameStore for PgStore {
    async fn game_exists(&mut self, id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM board_game WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.is_some())
    }

    async fn fetch_game(&mut self, id: i64) -> Result<Option<GameRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, year_published, min_players, max_players, age,
                   average_weight, playing_time, min_playing_time,
                   max_playing_time, thumbnail, image, sub_domain, average,
                   bayes_average, users_rated, old_rank
              FROM board_game
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(GameRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            year_published: row.try_get("year_published")?,
            min_players: row.try_get("min_players")?,
            max_players: row.try_get("max_players")?,
            age: row.try_get("age")?,
            average_weight: row.try_get("average_weight")?,
            playing_time: row.try_get("playing_time")?,
            min_playing_time: row.try_get("min_playing_time")?,
            max_playing_time: row.try_get("max_playing_time")?,
            thumbnail: row.try_get("thumbnail")?,
            image: row.try_get("image")?,
            sub_domain: row.try_get("sub_domain")?,
            average: row.try_get("average")?,
            bayes_average: row.try_get("bayes_average")?,
            users_rated: row.try_get("users_rated")?,
            old_rank: row.try_get("old_rank")?,
        }))
    }

    async fn insert_game(&mut self, record: &GameRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO board_game
                (id, name, year_published, min_players, max_players, age,
                 average_weight, playing_time, min_playing_time,
                 max_playing_time, thumbnail, image, sub_domain, average,
                 bayes_average, users_rated, old_rank)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17)
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(record.year_published)
        .bind(record.min_players)
        .bind(record.max_players)
        .bind(record.age)
        .bind(record.average_weight)
        .bind(record.playing_time)
        .bind(record.min_playing_time)
        .bind(record.max_playing_time)
        .bind(&record.thumbnail)
        .bind(&record.image)
        .bind(&record.sub_domain)
        .bind(record.average)
        .bind(record.bayes_average)
        .bind(record.users_rated)
        .bind(record.old_rank)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn replace_game(&mut self, record: &GameRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE board_game
               SET name = $2,
                   year_published = $3,
                   min_players = $4,
                   max_players = $5,
                   age = $6,
                   average_weight = $7,
                   playing_time = $8,
                   min_playing_time = $9,
                   max_playing_time = $10,
                   thumbnail = $11,
                   image = $12,
                   sub_domain = $13,
                   average = $14,
                   bayes_average = $15,
                   users_rated = $16
             WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(record.year_published)
        .bind(record.min_players)
        .bind(record.max_players)
        .bind(record.age)
        .bind(record.average_weight)
        .bind(record.playing_time)
        .bind(record.min_playing_time)
        .bind(record.max_playing_time)
        .bind(&record.thumbnail)
        .bind(&record.image)
        .bind(&record.sub_domain)
        .bind(record.average)
        .bind(record.bayes_average)
        .bind(record.users_rated)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn set_old_rank(&mut self, id: i64, old_rank: Option<i32>) -> Result<(), StoreError> {
        sqlx::query("UPDATE board_game SET old_rank = $2 WHERE id = $1")
            .bind(id)
            .bind(old_rank)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn upsert_description(&mut self, id: i64, text: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO board_game_description (game_id, full_description)
            VALUES ($1, $2)
            ON CONFLICT (game_id)
            DO UPDATE SET full_description = EXCLUDED.full_description
            "#,
        )
        .bind(id)
        .bind(text)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn rank_snapshot(&mut self) -> Result<HashMap<i64, i32>, StoreError> {
        let rows = sqlx::query("SELECT board_game_id, game_rank FROM game_rank")
            .fetch_all(&mut *self.tx)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("board_game_id")?, row.try_get("game_rank")?);
        }
        Ok(out)
    }

    async fn clear_ranks(&mut self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM game_rank")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_rank(&mut self, id: i64, rank: i32) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO game_rank (board_game_id, game_rank) VALUES ($1, $2)")
            .bind(id)
            .bind(rank)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn promoted_ids(&mut self) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT b.id
              FROM board_game b
              JOIN game_rank r ON b.id = r.board_game_id
             WHERE b.old_rank IS NOT NULL
               AND b.old_rank < r.game_rank
             ORDER BY r.game_rank
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }

    async fn purge_unranked(&mut self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM board_game
             WHERE id NOT IN (SELECT board_game_id FROM game_rank)
            "#,
        )
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_entity(
        &mut self,
        kind: TaxonomyKind,
        name: &str,
    ) -> Result<Option<i64>, StoreError> {
        let sql = format!("SELECT id FROM {} WHERE name = $1", kind.as_str());
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(|r| r.try_get("id").map_err(StoreError::from))
            .transpose()
    }

    async fn insert_entity(&mut self, kind: TaxonomyKind, name: &str) -> Result<i64, StoreError> {
        let sql = format!("INSERT INTO {} (name) VALUES ($1) RETURNING id", kind.as_str());
        let row = sqlx::query(&sql).bind(name).fetch_one(&mut *self.tx).await?;
        Ok(row.try_get("id")?)
    }

    async fn link_exists(
        &mut self,
        game_id: i64,
        kind: TaxonomyKind,
        entity_id: i64,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE board_game_id = $1 AND {} = $2",
            join_table(kind),
            join_column(kind)
        );
        let row = sqlx::query(&sql)
            .bind(game_id)
            .bind(entity_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_link(
        &mut self,
        game_id: i64,
        kind: TaxonomyKind,
        entity_id: i64,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (board_game_id, {}) VALUES ($1, $2)",
            join_table(kind),
            join_column(kind)
        );
        sqlx::query(&sql)
            .bind(game_id)
            .bind(entity_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Raw response artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed store for raw catalog responses. Kept for
/// diagnostics: malformed payloads can be inspected after the run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Store one catalog response body under `<stamp>/<game_id>/<hash>.xml`,
    /// writing through a temp file and an atomic rename.
    pub async fn store_response(
        &self,
        fetched_at: DateTime<Utc>,
        game_id: i64,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let dir = self.root.join(stamp).join(game_id.to_string());
        let absolute_path = dir.join(format!("{content_hash}.xml"));

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating artifact directory {}", dir.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    content_hash,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("renaming temp artifact to {}", absolute_path.display())
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch with bounded retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Fixed-interval retry budget: the catalog is rate-limit friendly, so the
/// delay does not grow between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn worst_case_wait(&self) -> Duration {
        self.delay
            .saturating_mul(self.max_attempts.saturating_sub(1) as u32)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            retry: config.retry,
        })
    }

    /// GET `url`, retrying transient failures up to the policy's budget.
    /// Non-retryable failures and exhausted budgets surface as [`FetchError`];
    /// the caller decides whether that aborts anything.
    pub async fn fetch_bytes(&self, game_id: i64, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("catalog_fetch", game_id, url);
        async {
            let attempts = self.retry.max_attempts.max(1);
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..attempts {
                match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();
                        if status.is_success() {
                            return Ok(resp.bytes().await?.to_vec());
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt + 1 < attempts
                        {
                            tokio::time::sleep(self.retry.delay).await;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt + 1 < attempts
                        {
                            last_request_error = Some(err);
                            tokio::time::sleep(self.retry.delay).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            Err(FetchError::Request(
                last_request_error.expect("retry loop captures a request error"),
            ))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geekrank_core::GameDraft;
    use tempfile::tempdir;

    fn record(id: i64, name: &str) -> GameRecord {
        GameRecord::from_draft(
            id,
            &GameDraft {
                name: name.to_string(),
                ..GameDraft::default()
            },
        )
    }

    #[tokio::test]
    async fn commit_publishes_staged_writes() {
        let backend = MemoryBackend::new();

        let mut store = backend.begin().await.unwrap();
        store.insert_game(&record(1, "Brass")).await.unwrap();
        assert!(store.game_exists(1).await.unwrap(), "read-your-writes");
        store.commit().await.unwrap();

        let mut reader = backend.begin().await.unwrap();
        assert!(reader.game_exists(1).await.unwrap());
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let backend = MemoryBackend::new();

        let mut store = backend.begin().await.unwrap();
        store.insert_game(&record(1, "Brass")).await.unwrap();
        store.rollback().await.unwrap();

        let mut reader = backend.begin().await.unwrap();
        assert!(!reader.game_exists(1).await.unwrap());
    }

    #[tokio::test]
    async fn rank_table_rejects_duplicates() {
        let backend = MemoryBackend::new();
        let mut store = backend.begin().await.unwrap();
        store.insert_game(&record(1, "Brass")).await.unwrap();
        store.insert_game(&record(2, "Root")).await.unwrap();
        store.insert_rank(1, 1).await.unwrap();

        assert!(matches!(
            store.insert_rank(1, 2).await,
            Err(StoreError::Constraint(_))
        ));
        assert!(matches!(
            store.insert_rank(2, 1).await,
            Err(StoreError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn entity_names_are_unique_per_kind() {
        let backend = MemoryBackend::new();
        let mut store = backend.begin().await.unwrap();

        let id = store
            .insert_entity(TaxonomyKind::Mechanic, "Deck Building")
            .await
            .unwrap();
        assert!(matches!(
            store
                .insert_entity(TaxonomyKind::Mechanic, "Deck Building")
                .await,
            Err(StoreError::Constraint(_))
        ));
        // Same name under a different kind is a different entity.
        let other = store
            .insert_entity(TaxonomyKind::Category, "Deck Building")
            .await
            .unwrap();
        assert_ne!(id, other);
        assert_eq!(
            store
                .find_entity(TaxonomyKind::Mechanic, "Deck Building")
                .await
                .unwrap(),
            Some(id)
        );
    }

    #[tokio::test]
    async fn purge_removes_games_without_rank_entries() {
        let backend = MemoryBackend::new();
        let mut store = backend.begin().await.unwrap();
        store.insert_game(&record(1, "Brass")).await.unwrap();
        store.insert_game(&record(2, "Root")).await.unwrap();
        store.upsert_description(2, "gone soon").await.unwrap();
        store.insert_rank(1, 1).await.unwrap();

        let purged = store.purge_unranked().await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.game_exists(1).await.unwrap());
        assert!(!store.game_exists(2).await.unwrap());
    }

    #[tokio::test]
    async fn promoted_ids_require_strictly_better_old_rank() {
        let backend = MemoryBackend::new();
        let mut store = backend.begin().await.unwrap();
        for (id, name) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
            store.insert_game(&record(id, name)).await.unwrap();
        }
        // old rank 1 -> current 3: moved, eligible.
        store.set_old_rank(1, Some(1)).await.unwrap();
        store.insert_rank(1, 3).await.unwrap();
        // old rank 2 == current 2: untouched.
        store.set_old_rank(2, Some(2)).await.unwrap();
        store.insert_rank(2, 2).await.unwrap();
        // old rank 4 -> current 1: improved the other way, not selected.
        store.set_old_rank(3, Some(4)).await.unwrap();
        store.insert_rank(3, 1).await.unwrap();
        // no history at all.
        store.insert_rank(4, 4).await.unwrap();

        assert_eq!(store.promoted_ids().await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn replace_game_preserves_rank_history() {
        let backend = MemoryBackend::new();
        let mut store = backend.begin().await.unwrap();
        store.insert_game(&record(1, "Brass")).await.unwrap();
        store.set_old_rank(1, Some(9)).await.unwrap();

        let mut refreshed = record(1, "Brass: Birmingham");
        refreshed.old_rank = None;
        store.replace_game(&refreshed).await.unwrap();

        let game = store.fetch_game(1).await.unwrap().unwrap();
        assert_eq!(game.name, "Brass: Birmingham");
        assert_eq!(game.old_rank, Some(9));
    }

    #[tokio::test]
    async fn artifacts_deduplicate_by_content_hash() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-08-01T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_response(fetched_at, 224517, b"<boardgames/>")
            .await
            .expect("first store");
        let second = store
            .store_response(fetched_at, 224517, b"<boardgames/>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn retry_policy_is_fixed_interval() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(5));
        assert_eq!(policy.worst_case_wait(), Duration::from_secs(20));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
