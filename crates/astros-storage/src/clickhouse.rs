//! Append-only raw payload table, backed by the ClickHouse HTTP interface.

use std::collections::HashSet;

use astros_core::CanonicalRecord;
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickHouseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub raw_table: String,
    /// Populated from `raw_table` by a materialized view on the server.
    pub derived_table: String,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8123,
            username: "default".to_string(),
            password: String::new(),
            database: "demo".to_string(),
            raw_table: "raw_astros".to_string(),
            derived_table: "people".to_string(),
        }
    }
}

impl ClickHouseConfig {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }

    pub fn qualified_raw_table(&self) -> String {
        format!("{}.{}", self.database, self.raw_table)
    }

    pub fn qualified_derived_table(&self) -> String {
        format!("{}.{}", self.database, self.derived_table)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("building clickhouse client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("clickhouse request to {endpoint} failed: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("clickhouse returned http {status}: {message}")]
    Server { status: u16, message: String },
    #[error("encoding raw row: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for canonical records. Rows are never deduplicated on insert;
/// only `compact` collapses rows that share a content hash.
#[async_trait]
pub trait RawPayloadStore: Send + Sync {
    async fn insert(&self, record: &CanonicalRecord) -> Result<(), StoreError>;
    async fn compact(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize)]
struct RawRow<'a> {
    data: &'a str,
    payload_hash: &'a str,
    #[serde(rename = "_inserted_at")]
    inserted_at: String,
}

/// One JSONEachRow line for the raw table, newline terminated.
pub fn raw_row_json(record: &CanonicalRecord) -> Result<String, StoreError> {
    let row = RawRow {
        data: &record.canonical_string,
        payload_hash: &record.content_hash,
        inserted_at: record
            .captured_at
            .to_rfc3339_opts(SecondsFormat::Micros, true),
    };
    let mut line = serde_json::to_string(&row)?;
    line.push('\n');
    Ok(line)
}

#[derive(Debug, Clone)]
pub struct ClickHouseStore {
    client: reqwest::Client,
    config: ClickHouseConfig,
    endpoint: String,
}

impl ClickHouseStore {
    pub fn new(config: ClickHouseConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(StoreError::Client)?;
        let endpoint = config.endpoint();
        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    pub fn insert_statement(&self) -> String {
        format!(
            "INSERT INTO {} (data, payload_hash, _inserted_at) FORMAT JSONEachRow",
            self.config.qualified_raw_table()
        )
    }

    /// Raw table first, then the derived table.
    pub fn optimize_statements(&self) -> [String; 2] {
        [
            format!(
                "OPTIMIZE TABLE {} FINAL DEDUPLICATE",
                self.config.qualified_raw_table()
            ),
            format!(
                "OPTIMIZE TABLE {} FINAL DEDUPLICATE",
                self.config.qualified_derived_table()
            ),
        ]
    }

    async fn execute(&self, params: &[(&str, &str)], body: String) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .query(&[("database", self.config.database.as_str())])
            .query(params)
            .header("X-ClickHouse-User", &self.config.username)
            .header("X-ClickHouse-Key", &self.config.password)
            .body(body)
            .send()
            .await
            .map_err(|source| StoreError::Connection {
                endpoint: self.endpoint.clone(),
                source,
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(server_error(status.as_u16(), resp.text().await))
    }
}

fn server_error<E: std::fmt::Display>(status: u16, body: Result<String, E>) -> StoreError {
    let message = match body {
        Ok(text) => text.trim().to_string(),
        Err(err) => format!("<unreadable body: {err}>"),
    };
    StoreError::Server { status, message }
}

#[async_trait]
impl RawPayloadStore for ClickHouseStore {
    async fn insert(&self, record: &CanonicalRecord) -> Result<(), StoreError> {
        let row = raw_row_json(record)?;
        let statement = self.insert_statement();
        self.execute(
            &[
                ("query", statement.as_str()),
                ("date_time_input_format", "best_effort"),
            ],
            row,
        )
        .await?;
        info!(
            table = %self.config.qualified_raw_table(),
            hash = record.short_hash(),
            "raw row inserted"
        );
        Ok(())
    }

    async fn compact(&self) -> Result<(), StoreError> {
        for statement in self.optimize_statements() {
            self.execute(&[("wait_end_of_query", "1")], statement.clone())
                .await?;
            info!(%statement, "table optimized");
        }
        Ok(())
    }
}

/// In-process stand-in for the raw table. `compact` keeps the first row per
/// content hash, mirroring `OPTIMIZE ... DEDUPLICATE` on the hash key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<CanonicalRecord>>,
    compactions: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<CanonicalRecord> {
        self.rows.lock().await.clone()
    }

    pub async fn compactions(&self) -> usize {
        *self.compactions.lock().await
    }
}

#[async_trait]
impl RawPayloadStore for MemoryStore {
    async fn insert(&self, record: &CanonicalRecord) -> Result<(), StoreError> {
        self.rows.lock().await.push(record.clone());
        Ok(())
    }

    async fn compact(&self) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let mut seen = HashSet::new();
        rows.retain(|row| seen.insert(row.content_hash.clone()));
        *self.compactions.lock().await += 1;
        Ok(())
    }
}
