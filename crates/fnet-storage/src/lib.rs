//! Document persistence + HTTP fetch utilities for the FNET sync.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use fnet_core::DocumentRecord;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::{InMemoryDocumentStore, InMemorySession};
pub use postgres::{PgDocumentStore, PgSession};

pub const CRATE_NAME: &str = "fnet-storage";

/// Default number of ids pulled per round trip by [`DocumentIdChunks`].
pub const DEFAULT_ID_CHUNK_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Thin reqwest wrapper. One request per call; retries are left to the next
/// scheduled run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },
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
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// Fetch and parse a JSON body. A 2xx response whose body is not JSON is a
    /// transport failure, not a schema one.
    pub async fn fetch_json(
        &self,
        run_id: Uuid,
        url: &str,
        query: &[(String, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let response = self.fetch_bytes(run_id, url, query).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::InvalidJson {
            url: response.final_url,
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Watermark reads plus the factory for write sessions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    type Session: StoreSession;

    /// Open a write session. Writes stay invisible to other readers until
    /// [`StoreSession::commit`].
    async fn begin(&self) -> Result<Self::Session, StoreError>;

    /// Highest committed delivery timestamp, `None` for an empty store.
    async fn last_delivery_timestamp(&self) -> Result<Option<NaiveDateTime>, StoreError>;

    /// Distinct persisted document ids strictly greater than `after`, ascending,
    /// skipping `exclude`, at most `limit` of them.
    async fn document_ids_after(
        &self,
        after: Option<i64>,
        exclude: &[i64],
        limit: usize,
    ) -> Result<Vec<i64>, StoreError>;

    fn persisted_document_ids(&self, exclude: Vec<i64>, chunk_size: usize) -> DocumentIdChunks<'_, Self>
    where
        Self: Sized,
    {
        DocumentIdChunks::new(self, exclude, chunk_size)
    }
}

/// Upsert sink bound to one transaction at a time.
#[async_trait]
pub trait StoreSession: Send {
    /// Insert the record, or overwrite the row sharing its natural key.
    async fn upsert(&mut self, record: &DocumentRecord) -> Result<UpsertOutcome, StoreError>;

    /// Make every write since the previous commit durable.
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard every write since the previous commit.
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Keyset-paginated walk over persisted document ids. Calling
/// [`DocumentStore::persisted_document_ids`] again restarts from the lowest id.
pub struct DocumentIdChunks<'a, S> {
    store: &'a S,
    exclude: Vec<i64>,
    chunk_size: usize,
    cursor: Option<i64>,
    exhausted: bool,
}

impl<'a, S: DocumentStore> DocumentIdChunks<'a, S> {
    pub fn new(store: &'a S, exclude: Vec<i64>, chunk_size: usize) -> Self {
        Self {
            store,
            exclude,
            chunk_size: chunk_size.max(1),
            cursor: None,
            exhausted: false,
        }
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Vec<i64>>, StoreError> {
        if self.exhausted {
            return Ok(None);
        }

        let ids = self
            .store
            .document_ids_after(self.cursor, &self.exclude, self.chunk_size)
            .await?;
        if ids.len() < self.chunk_size {
            self.exhausted = true;
        }

        match ids.last() {
            Some(last) => {
                self.cursor = Some(*last);
                Ok(Some(ids))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Drain every remaining chunk into one vector.
    pub async fn collect_all(mut self) -> Result<Vec<i64>, StoreError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend(chunk);
        }
        Ok(out)
    }
}
