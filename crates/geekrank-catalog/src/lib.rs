//! Catalog client and ranked dataset source for Geekrank.
//!
//! The catalog answers per-game XML documents; responses are parsed with
//! selector-based extraction. Per-game failures are values ([`CatalogFailure`])
//! so the reconciliation loop can skip and continue.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use geekrank_core::{GameDraft, RankedRow};
use geekrank_store::{ArtifactStore, HttpClientConfig, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "geekrank-catalog";

/// Why a single identifier could not be reconciled this run. Never fatal to
/// the run as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogFailure {
    /// Transient failure that survived the whole retry budget.
    #[error("catalog unavailable")]
    Unavailable,
    /// The response came back but its structure is not a game document.
    #[error("malformed catalog response: {0}")]
    Malformed(String),
    /// Structurally fine, but no primary name; the game cannot be persisted.
    #[error("response has no primary name")]
    MissingName,
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn fetch(&self, id: i64) -> Result<GameDraft, CatalogFailure>;
}

// ---------------------------------------------------------------------------
// XML document parsing
// ---------------------------------------------------------------------------

fn selector(css: &str) -> Result<Selector, CatalogFailure> {
    Selector::parse(css).map_err(|e| CatalogFailure::Malformed(e.to_string()))
}

fn first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, CatalogFailure> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).next().and_then(|n| {
        let text = n.text().collect::<String>();
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }))
}

fn all_texts(scope: ElementRef<'_>, css: &str) -> Result<Vec<String>, CatalogFailure> {
    let sel = selector(css)?;
    Ok(scope
        .select(&sel)
        .filter_map(|n| {
            let text = n.text().collect::<String>();
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect())
}

fn first_i32(scope: ElementRef<'_>, css: &str) -> Result<Option<i32>, CatalogFailure> {
    Ok(first_text(scope, css)?.and_then(|t| t.parse().ok()))
}

fn first_i64(scope: ElementRef<'_>, css: &str) -> Result<Option<i64>, CatalogFailure> {
    Ok(first_text(scope, css)?.and_then(|t| t.parse().ok()))
}

fn first_f64(scope: ElementRef<'_>, css: &str) -> Result<Option<f64>, CatalogFailure> {
    Ok(first_text(scope, css)?.and_then(|t| t.parse().ok()))
}

/// Parse one catalog game document into a draft.
///
/// The document is tree-shaped with a root element wrapping a single
/// `boardgame` element; a missing `boardgame` element means the payload is
/// not a game document at all.
pub fn parse_game_document(xml: &str) -> Result<GameDraft, CatalogFailure> {
    // The HTML tokenizer rewrites an `<image>` start tag to `<img>`, which is
    // a void element and would orphan the URL text. Keep it addressable.
    let xml = xml
        .replace("<image>", "<imagelink>")
        .replace("</image>", "</imagelink>");
    let doc = Html::parse_document(&xml);

    let game_sel = selector("boardgame")?;
    let Some(game) = doc.select(&game_sel).next() else {
        return Err(CatalogFailure::Malformed(
            "no boardgame element in response".to_string(),
        ));
    };

    let Some(name) = first_text(game, r#"name[primary="true"]"#)? else {
        return Err(CatalogFailure::MissingName);
    };

    Ok(GameDraft {
        name,
        year_published: first_i32(game, "yearpublished")?,
        min_players: first_i32(game, "minplayers")?,
        max_players: first_i32(game, "maxplayers")?,
        age: first_i32(game, "age")?,
        average_weight: first_f64(game, "statistics ratings averageweight")?,
        playing_time: first_i32(game, "playingtime")?,
        min_playing_time: first_i32(game, "minplaytime")?,
        max_playing_time: first_i32(game, "maxplaytime")?,
        description: first_text(game, "description")?,
        thumbnail: first_text(game, "thumbnail")?,
        image: first_text(game, "imagelink")?,
        sub_domain: first_text(game, "boardgamesubdomain")?,
        average: first_f64(game, "statistics ratings average")?,
        bayes_average: first_f64(game, "statistics ratings bayesaverage")?,
        users_rated: first_i64(game, "statistics ratings usersrated")?,
        publishers: all_texts(game, "boardgamepublisher")?,
        honors: all_texts(game, "boardgamehonor")?,
        mechanics: all_texts(game, "boardgamemechanic")?,
        categories: all_texts(game, "boardgamecategory")?,
    })
}

// ---------------------------------------------------------------------------
// HTTP catalog client
// ---------------------------------------------------------------------------

pub const DEFAULT_API_BASE: &str = "https://api.geekdo.com/xmlapi";

pub struct HttpCatalogClient {
    fetcher: HttpFetcher,
    base_url: String,
    artifacts: Option<ArtifactStore>,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            fetcher: HttpFetcher::new(config)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            artifacts: None,
        })
    }

    /// Keep raw response bodies around for post-run diagnostics.
    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    fn game_url(&self, id: i64) -> String {
        format!("{}/boardgame/{id}?stats=1", self.base_url)
    }

    async fn archive(&self, id: i64, body: &[u8]) {
        let Some(store) = &self.artifacts else {
            return;
        };
        if let Err(err) = store.store_response(Utc::now(), id, body).await {
            warn!(game_id = id, "failed to archive catalog response: {err:#}");
        }
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn fetch(&self, id: i64) -> Result<GameDraft, CatalogFailure> {
        let url = self.game_url(id);
        let body = match self.fetcher.fetch_bytes(id, &url).await {
            Ok(body) => body,
            Err(err) => {
                warn!(game_id = id, "catalog fetch failed: {err}");
                return Err(CatalogFailure::Unavailable);
            }
        };
        self.archive(id, &body).await;

        let text = String::from_utf8_lossy(&body);
        match parse_game_document(&text) {
            Ok(draft) => Ok(draft),
            Err(CatalogFailure::Malformed(reason)) => {
                warn!(game_id = id, reason, "malformed catalog response");
                Err(CatalogFailure::Malformed(reason))
            }
            Err(other) => Err(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Ranked dataset source
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DatasetRow {
    id: i64,
    #[serde(default)]
    rank: Option<f64>,
    #[serde(default, rename = "bayesaverage")]
    bayes_average: Option<f64>,
    #[serde(default)]
    average: Option<f64>,
}

/// Load the flat ranked dataset, normalizing zero and empty numeric fields to
/// "missing".
pub fn load_ranked_rows(path: impl AsRef<Path>) -> Result<Vec<RankedRow>> {
    let path = path.as_ref();
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for record in reader.deserialize::<DatasetRow>() {
        let row = record.with_context(|| format!("parsing {}", path.display()))?;
        rows.push(RankedRow::new(
            row.id,
            row.rank.unwrap_or(0.0) as u32,
            row.bayes_average.unwrap_or(0.0),
            row.average.unwrap_or(0.0),
        ));
    }
    Ok(rows)
}

/// Persist the sorted identifier view for auditability.
pub fn write_sorted_view(path: impl AsRef<Path>, ids: &[i64]) -> Result<()> {
    let path = path.as_ref();
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(["id"]).context("writing header")?;
    for id in ids {
        writer
            .write_record([id.to_string()])
            .with_context(|| format!("writing row for {id}"))?;
    }
    writer.flush().context("flushing sorted view")?;
    Ok(())
}
