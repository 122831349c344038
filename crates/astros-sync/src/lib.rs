//! Ingestion pipeline: fetch the source document, canonicalize it, append it to the raw table.

use std::time::Duration;

use anyhow::{Context, Result};
use astros_core::CanonicalRecord;
use astros_storage::{
    BackoffPolicy, ClickHouseConfig, ClickHouseStore, HttpClientConfig, HttpTransport,
    JsonFetcher, RawPayloadStore, ReqwestTransport, Sleeper, TokioSleeper, DEFAULT_USER_AGENT,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "astros-sync";

pub const DEFAULT_SOURCE_URL: &str = "http://api.open-notify.org/astros.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be a port number, got {value:?}")]
    InvalidPort { key: &'static str, value: String },
}

/// Everything a run needs, resolved up front and handed to each component.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub source_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_secs: f64,
    pub clickhouse: ClickHouseConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 10,
            max_attempts: backoff.max_attempts,
            backoff_base_secs: backoff.base_secs,
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay `SOURCE_URL` and `CLICKHOUSE_*` values from `lookup` onto the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("SOURCE_URL") {
            config.source_url = url;
        }

        let ch = &mut config.clickhouse;
        if let Some(host) = lookup("CLICKHOUSE_HOST") {
            ch.host = host;
        }
        if let Some(port) = lookup("CLICKHOUSE_PORT") {
            ch.port = port.trim().parse().map_err(|_| ConfigError::InvalidPort {
                key: "CLICKHOUSE_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(user) = lookup("CLICKHOUSE_USER") {
            ch.username = user;
        }
        if let Some(password) = lookup("CLICKHOUSE_PASSWORD") {
            ch.password = password;
        }
        if let Some(database) = lookup("CLICKHOUSE_DB") {
            ch.database = database;
        }
        Ok(config)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_secs: self.backoff_base_secs,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: self.backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub content_hash: String,
    pub captured_at: DateTime<Utc>,
    pub payload_bytes: usize,
    pub attempts: u32,
}

pub struct IngestPipeline<W = ClickHouseStore, T = ReqwestTransport, S = TokioSleeper> {
    source_url: String,
    fetcher: JsonFetcher<T, S>,
    store: W,
}

impl IngestPipeline {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let fetcher =
            JsonFetcher::new(config.http_client_config()).context("configuring source fetcher")?;
        let store =
            ClickHouseStore::new(config.clickhouse.clone()).context("configuring clickhouse store")?;
        Ok(Self::with_parts(config.source_url.clone(), fetcher, store))
    }
}

impl<W, T, S> IngestPipeline<W, T, S>
where
    W: RawPayloadStore,
    T: HttpTransport,
    S: Sleeper,
{
    pub fn with_parts(source_url: impl Into<String>, fetcher: JsonFetcher<T, S>, store: W) -> Self {
        Self {
            source_url: source_url.into(),
            fetcher,
            store,
        }
    }

    pub fn store(&self) -> &W {
        &self.store
    }

    /// Fetch, canonicalize and insert once. Nothing is written unless the fetch succeeds.
    pub async fn run_once(&self) -> Result<IngestRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        info!(url = %self.source_url, "starting ingest");

        let fetched = self
            .fetcher
            .fetch_json(&self.source_url)
            .await
            .with_context(|| format!("fetching {}", self.source_url))?;

        let captured_at = Utc::now();
        let record = CanonicalRecord::capture(&fetched.value, captured_at);
        info!(
            hash = record.short_hash(),
            captured_at = %captured_at.to_rfc3339(),
            "record prepared"
        );

        self.store
            .insert(&record)
            .await
            .context("inserting raw record")?;

        Ok(IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            content_hash: record.content_hash,
            captured_at,
            payload_bytes: record.canonical_string.len(),
            attempts: fetched.attempts,
        })
    }
}

pub async fn run_ingest_once(config: &IngestConfig) -> Result<IngestRunSummary> {
    IngestPipeline::new(config)?.run_once().await
}

/// Deduplicate the raw table and its derived table. The ingest run never calls this.
pub async fn compact_tables<W: RawPayloadStore>(store: &W) -> Result<()> {
    store
        .compact()
        .await
        .context("optimizing raw and derived tables")
}

pub async fn run_compaction(config: &IngestConfig) -> Result<()> {
    let store =
        ClickHouseStore::new(config.clickhouse.clone()).context("configuring clickhouse store")?;
    compact_tables(&store).await
}
