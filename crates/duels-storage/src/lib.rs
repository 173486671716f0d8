//! Relational store access + HTTP fetch utilities for the Duels pipeline.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duels_core::{DuelsRunSummaryRow, LootCategory, LootRecord, MatchSummaryRecord};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "duels-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("unexpected value in column {column}: {message}")]
    Decode {
        column: &'static str,
        message: String,
    },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Read/write port over the run tables. Every query binds its values as parameters.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Loot picks of the tracked categories, with the chosen option already resolved.
    async fn fetch_loot(&self, run_id: &str) -> Result<Vec<LootRecord>, StoreError>;

    /// Matches of the run that carry a recorded deck string.
    async fn fetch_matches(&self, run_id: &str) -> Result<Vec<MatchSummaryRecord>, StoreError>;

    /// Insert-or-replace keyed on the run id.
    async fn upsert_summary(&self, row: &DuelsRunSummaryRow) -> Result<(), StoreError>;

    async fn close(&self) {}
}

const LOOT_QUERY: &str = r#"
    SELECT bundle_type,
           CASE
               WHEN chosen_option_index = 1 THEN option1
               WHEN chosen_option_index = 2 THEN option2
               ELSE option3
           END AS picked_treasure
      FROM dungeon_run_loot_info
     WHERE run_id = $1
       AND bundle_type = ANY($2)
     ORDER BY id
"#;

const MATCHES_QUERY: &str = r#"
    SELECT creation_date, player_class, player_card_id, player_rank, player_decklist, additional_result
      FROM replay_summary
     WHERE run_id = $1
       AND player_decklist IS NOT NULL
     ORDER BY creation_date
"#;

const UPSERT_SUMMARY: &str = r#"
    INSERT INTO duels_stats_by_run (
        game_mode, run_start_date, run_end_date, build_number, rating, run_id,
        player_class, decklist, final_decklist, hero, hero_power, signature_treasure,
        treasures, passives, wins, losses
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
    ON CONFLICT (run_id) DO UPDATE SET
        game_mode = EXCLUDED.game_mode,
        run_start_date = EXCLUDED.run_start_date,
        run_end_date = EXCLUDED.run_end_date,
        build_number = EXCLUDED.build_number,
        rating = EXCLUDED.rating,
        player_class = EXCLUDED.player_class,
        decklist = EXCLUDED.decklist,
        final_decklist = EXCLUDED.final_decklist,
        hero = EXCLUDED.hero,
        hero_power = EXCLUDED.hero_power,
        signature_treasure = EXCLUDED.signature_treasure,
        treasures = EXCLUDED.treasures,
        passives = EXCLUDED.passives,
        wins = EXCLUDED.wins,
        losses = EXCLUDED.losses
"#;

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub async fn connect(database_url: &str, config: PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await?;
        tracing::info!(max_connections = config.max_connections, "connected to run store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("run store migrations applied");
        Ok(())
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn fetch_loot(&self, run_id: &str) -> Result<Vec<LootRecord>, StoreError> {
        let categories = LootCategory::ALL
            .iter()
            .map(|c| c.as_str().to_string())
            .collect::<Vec<_>>();
        let rows = sqlx::query(LOOT_QUERY)
            .bind(run_id)
            .bind(&categories)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let bundle_type: String = row.try_get("bundle_type")?;
            let category = bundle_type
                .parse::<LootCategory>()
                .map_err(|err| StoreError::Decode {
                    column: "bundle_type",
                    message: err.to_string(),
                })?;
            out.push(LootRecord {
                category,
                picked_card_id: row.try_get("picked_treasure")?,
            });
        }
        Ok(out)
    }

    async fn fetch_matches(&self, run_id: &str) -> Result<Vec<MatchSummaryRecord>, StoreError> {
        let rows = sqlx::query(MATCHES_QUERY)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let creation_date: DateTime<Utc> = row.try_get("creation_date")?;
            out.push(MatchSummaryRecord {
                creation_date,
                player_class: row.try_get("player_class")?,
                player_card_id: row.try_get("player_card_id")?,
                player_rank: row.try_get("player_rank")?,
                player_decklist: row.try_get("player_decklist")?,
                additional_result: row.try_get("additional_result")?,
            });
        }
        Ok(out)
    }

    async fn upsert_summary(&self, row: &DuelsRunSummaryRow) -> Result<(), StoreError> {
        sqlx::query(UPSERT_SUMMARY)
            .bind(&row.game_mode)
            .bind(row.run_start_date)
            .bind(row.run_end_date)
            .bind(row.build_number)
            .bind(row.rating)
            .bind(&row.run_id)
            .bind(&row.player_class)
            .bind(&row.decklist)
            .bind(&row.final_decklist)
            .bind(&row.hero)
            .bind(&row.hero_power)
            .bind(&row.signature_treasure)
            .bind(&row.treasures)
            .bind(&row.passives)
            .bind(row.wins)
            .bind(row.losses)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Process-local store with the same upsert semantics as [`PgRunStore`].
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    loot: HashMap<String, Vec<LootRecord>>,
    matches: HashMap<String, Vec<MatchSummaryRecord>>,
    summaries: BTreeMap<String, DuelsRunSummaryRow>,
    writes: usize,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_loot(&self, run_id: &str, record: LootRecord) {
        let mut state = self.state.lock().await;
        state.loot.entry(run_id.to_string()).or_default().push(record);
    }

    pub async fn add_match(&self, run_id: &str, record: MatchSummaryRecord) {
        let mut state = self.state.lock().await;
        state
            .matches
            .entry(run_id.to_string())
            .or_default()
            .push(record);
    }

    pub async fn summaries(&self) -> Vec<DuelsRunSummaryRow> {
        self.state.lock().await.summaries.values().cloned().collect()
    }

    pub async fn summary(&self, run_id: &str) -> Option<DuelsRunSummaryRow> {
        self.state.lock().await.summaries.get(run_id).cloned()
    }

    /// Number of upserts issued, including replacements.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn fetch_loot(&self, run_id: &str) -> Result<Vec<LootRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .loot
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_matches(&self, run_id: &str) -> Result<Vec<MatchSummaryRecord>, StoreError> {
        let mut matches = self
            .state
            .lock()
            .await
            .matches
            .get(run_id)
            .cloned()
            .unwrap_or_default();
        matches.sort_by_key(|m| m.creation_date);
        Ok(matches)
    }

    async fn upsert_summary(&self, row: &DuelsRunSummaryRow) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.summaries.insert(row.run_id.clone(), row.clone());
        state.writes += 1;
        Ok(())
    }
}

/// How a failed card metadata attempt bears on the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardFetchFailure {
    /// CDN hiccup or throttling.
    Transient,
    /// The source answered for good, e.g. a 404 on a mistyped `DUELS_CARDS_URL`.
    Permanent,
}

impl CardFetchFailure {
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Self::Transient,
            s if s.is_server_error() => Self::Transient,
            _ => Self::Permanent,
        }
    }

    pub fn from_request_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_body() {
            Self::Transient
        } else {
            Self::Permanent
        }
    }
}

/// Retry schedule for the card metadata download: doubling delays, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetrySchedule {
    pub fn delay_before_retry(&self, retries_done: usize) -> Duration {
        let factor = u32::try_from(retries_done)
            .ok()
            .and_then(|n| 1u32.checked_shl(n))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn allows_retry(&self, retries_done: usize, failure: CardFetchFailure) -> bool {
        failure == CardFetchFailure::Transient && retries_done < self.max_retries
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetrySchedule,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetrySchedule::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("card metadata request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("card metadata source {url} answered {status} after {attempts} attempt(s)")]
    HttpStatus {
        url: String,
        status: u16,
        attempts: usize,
    },
}

/// Card metadata downloader; transient failures are retried on a [`RetrySchedule`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetrySchedule,
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
        let client = builder.build().context("building card metadata client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetch_with_retries(url)
            .instrument(info_span!("card_metadata_fetch", url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut retries_done = 0usize;
        loop {
            let attempts = retries_done + 1;
            let (failure, reason) = match self.fetch_once(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(Attempt::Status(status)) => {
                    let failure = CardFetchFailure::from_status(status);
                    if !self.retry.allows_retry(retries_done, failure) {
                        return Err(FetchError::HttpStatus {
                            url: url.to_string(),
                            status: status.as_u16(),
                            attempts,
                        });
                    }
                    (failure, status.to_string())
                }
                Err(Attempt::Transport(source)) => {
                    let failure = CardFetchFailure::from_request_error(&source);
                    if !self.retry.allows_retry(retries_done, failure) {
                        return Err(FetchError::Request {
                            url: url.to_string(),
                            attempts,
                            source,
                        });
                    }
                    (failure, source.to_string())
                }
            };

            let delay = self.retry.delay_before_retry(retries_done);
            tracing::warn!(attempts, ?failure, ?delay, %reason, "card metadata source unavailable, retrying");
            tokio::time::sleep(delay).await;
            retries_done += 1;
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, Attempt> {
        let resp = self.client.get(url).send().await.map_err(Attempt::Transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Attempt::Status(status));
        }
        let bytes = resp.bytes().await.map_err(Attempt::Transport)?;
        Ok(bytes.to_vec())
    }
}

enum Attempt {
    Status(StatusCode),
    Transport(reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn summary(run_id: &str, wins: i32) -> DuelsRunSummaryRow {
        let ts = Utc.with_ymd_and_hms(2021, 6, 1, 10, 0, 0).single().unwrap();
        DuelsRunSummaryRow {
            game_mode: "paid-duels".into(),
            run_start_date: ts,
            run_end_date: ts,
            build_number: Some(1),
            rating: None,
            run_id: run_id.into(),
            player_class: None,
            decklist: "AAEBAQcAAAA=".into(),
            final_decklist: None,
            hero: None,
            hero_power: None,
            signature_treasure: None,
            treasures: String::new(),
            passives: String::new(),
            wins,
            losses: 0,
        }
    }

    #[tokio::test]
    async fn memory_store_upserts_by_run_id() {
        let store = MemoryRunStore::new();
        store.upsert_summary(&summary("run-1", 1)).await.unwrap();
        store.upsert_summary(&summary("run-1", 2)).await.unwrap();
        store.upsert_summary(&summary("run-2", 0)).await.unwrap();

        assert_eq!(store.write_count().await, 3);
        assert_eq!(store.summaries().await.len(), 2);
        assert_eq!(store.summary("run-1").await.map(|r| r.wins), Some(2));
    }

    #[tokio::test]
    async fn memory_store_returns_matches_in_creation_order() {
        let store = MemoryRunStore::new();
        for (hour, tally) in [(12, "1-0"), (10, "0-0")] {
            store
                .add_match(
                    "run-1",
                    MatchSummaryRecord {
                        creation_date: Utc.with_ymd_and_hms(2021, 6, 1, hour, 0, 0).single().unwrap(),
                        player_class: Some("mage".into()),
                        player_card_id: Some("HERO_08".into()),
                        player_rank: None,
                        player_decklist: "deck".into(),
                        additional_result: Some(tally.into()),
                    },
                )
                .await;
        }
        let matches = store.fetch_matches("run-1").await.unwrap();
        assert_eq!(matches[0].additional_result.as_deref(), Some("0-0"));
        assert!(store.fetch_matches("run-2").await.unwrap().is_empty());
        assert!(store.fetch_loot("run-1").await.unwrap().is_empty());
    }

    #[test]
    fn queries_only_use_bind_parameters() {
        for sql in [LOOT_QUERY, MATCHES_QUERY, UPSERT_SUMMARY] {
            assert!(sql.contains("$1"));
            assert!(!sql.contains('\''));
        }
        assert!(UPSERT_SUMMARY.contains("$16"));
        assert!(UPSERT_SUMMARY.contains("ON CONFLICT (run_id)"));
    }

    #[test]
    fn card_retry_schedule_doubles_up_to_the_cap() {
        let schedule = RetrySchedule::default();
        let delays = (0..6)
            .map(|n| schedule.delay_before_retry(n).as_millis())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000]);
        assert_eq!(schedule.delay_before_retry(usize::MAX), Duration::from_secs(8));

        assert!(schedule.allows_retry(2, CardFetchFailure::Transient));
        assert!(!schedule.allows_retry(3, CardFetchFailure::Transient));
        assert!(!schedule.allows_retry(0, CardFetchFailure::Permanent));
    }

    #[test]
    fn status_classification_retries_server_errors_and_throttling() {
        for status in [
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert_eq!(CardFetchFailure::from_status(status), CardFetchFailure::Transient);
        }
        for status in [StatusCode::NOT_FOUND, StatusCode::FORBIDDEN] {
            assert_eq!(CardFetchFailure::from_status(status), CardFetchFailure::Permanent);
        }
    }

    const CARDS_BODY: &str = r#"[{"id":"HERO_08","dbfId":637}]"#;

    /// Serves `CARDS_BODY` after answering with `failures` in order; counts every hit.
    async fn flaky_card_source(failures: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/cards.json",
            axum::routing::get(move || {
                let counter = counter.clone();
                let failures = failures.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let code = failures.get(n).copied().unwrap_or(200);
                    (axum::http::StatusCode::from_u16(code).unwrap(), CARDS_BODY)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/cards.json"), hits)
    }

    fn quick_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("duels-test".into()),
            retry: RetrySchedule {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn card_download_retries_transient_statuses() {
        let (url, hits) = flaky_card_source(vec![503, 429]).await;
        let bytes = quick_fetcher().fetch_bytes(&url).await.unwrap();
        assert_eq!(bytes, CARDS_BODY.as_bytes());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn card_download_fails_fast_on_not_found() {
        let (url, hits) = flaky_card_source(vec![404]).await;
        let err = quick_fetcher().fetch_bytes(&url).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::HttpStatus { status: 404, attempts: 1, .. }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn card_download_gives_up_after_the_retry_budget() {
        let (url, hits) = flaky_card_source(vec![503; 10]).await;
        let err = quick_fetcher().fetch_bytes(&url).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::HttpStatus { status: 503, attempts: 3, .. }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("card metadata source"));
    }
}
