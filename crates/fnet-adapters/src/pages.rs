//! Lazy pagination over the registry search endpoint.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use fnet_core::{format_query_date, DocumentRecord, PageEnvelope};
use fnet_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::records::decode_page;

pub const DEFAULT_ENDPOINT: &str =
    "https://fnet.bmfbovespa.com.br/fnet/publico/pesquisarGerenciadorDocumentosDados";
pub const DEFAULT_PAGE_SIZE: u64 = 200;
pub const DEFAULT_FUND_TYPE: u32 = 1;
pub const DEFAULT_DOCUMENT_CATEGORY: u32 = 14;

/// Sort direction on the delivery timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOrder {
    #[default]
    Asc,
    Desc,
}

impl DeliveryOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    /// Whether a run that stops early leaves nothing unfetched below the
    /// delivery watermark. Only true for ascending order.
    pub fn resumes_safely(self) -> bool {
        matches!(self, Self::Asc)
    }
}

impl fmt::Display for DeliveryOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown delivery order {other:?} (expected asc or desc)")),
        }
    }
}

/// Fixed filters sent with every page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryQuery {
    pub page_size: u64,
    pub fund_type: u32,
    pub document_category: u32,
    pub order: DeliveryOrder,
}

impl Default for RegistryQuery {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            fund_type: DEFAULT_FUND_TYPE,
            document_category: DEFAULT_DOCUMENT_CATEGORY,
            order: DeliveryOrder::default(),
        }
    }
}

/// Query string for page `page` (zero based).
pub fn build_query_params(
    query: &RegistryQuery,
    page: u64,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Vec<(String, String)> {
    let mut params = vec![
        ("d".to_string(), "0".to_string()),
        ("s".to_string(), (page * query.page_size).to_string()),
        ("l".to_string(), query.page_size.to_string()),
        ("tipoFundo".to_string(), query.fund_type.to_string()),
        (
            "idCategoriaDocumento".to_string(),
            query.document_category.to_string(),
        ),
        ("o[0][dataEntrega]".to_string(), query.order.to_string()),
    ];
    if let Some(start) = start {
        params.push(("dataInicial".to_string(), format_query_date(start)));
    }
    if let Some(end) = end {
        params.push(("dataFinal".to_string(), format_query_date(end)));
    }
    params
}

/// `ceil(records_total / page_size)`.
pub fn total_pages(records_total: u64, page_size: u64) -> u64 {
    records_total.div_ceil(page_size.max(1))
}

#[derive(Debug, Clone)]
pub struct PageSource {
    fetcher: HttpFetcher,
    endpoint: String,
    query: RegistryQuery,
}

impl PageSource {
    pub fn new(fetcher: HttpFetcher, endpoint: impl Into<String>, query: RegistryQuery) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
            query,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn query(&self) -> &RegistryQuery {
        &self.query
    }

    /// Start a fresh pass over every page matching the date bounds. Nothing is
    /// fetched until the first [`PageCursor::next_record`] call.
    pub fn enumerate(
        &self,
        run_id: Uuid,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> PageCursor<'_> {
        PageCursor {
            source: self,
            run_id,
            start,
            end,
            next_page: 0,
            buffered: VecDeque::new(),
            finished: false,
            stats: PaginationStats::default(),
        }
    }
}

/// Why a pass ended before its last expected page.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaginationAbort {
    #[error("page {page}: transport failure: {message}")]
    Transport { page: u64, message: String },
    #[error("page {page}: schema failure: {message}")]
    Schema { page: u64, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PaginationStats {
    /// Known once page 0 decodes.
    pub pages_expected: Option<u64>,
    pub pages_fetched: u64,
    /// `recordsTotal` from page 0.
    pub records_reported: Option<u64>,
    pub records_yielded: u64,
    pub records_skipped: u64,
    pub abort: Option<PaginationAbort>,
}

impl PaginationStats {
    pub fn completed(&self) -> bool {
        self.abort.is_none()
    }
}

/// Single forward pass over the pages of one [`PageSource::enumerate`] call.
/// Fetch failures end the pass; they never surface as errors.
pub struct PageCursor<'a> {
    source: &'a PageSource,
    run_id: Uuid,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    next_page: u64,
    buffered: VecDeque<DocumentRecord>,
    finished: bool,
    stats: PaginationStats,
}

impl PageCursor<'_> {
    pub async fn next_record(&mut self) -> Option<DocumentRecord> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                self.stats.records_yielded += 1;
                return Some(record);
            }
            if self.finished {
                return None;
            }
            self.load_next_page().await;
        }
    }

    pub fn stats(&self) -> &PaginationStats {
        &self.stats
    }

    pub fn into_stats(self) -> PaginationStats {
        self.stats
    }

    async fn load_next_page(&mut self) {
        let page = self.next_page;
        if let Some(expected) = self.stats.pages_expected {
            if page >= expected {
                self.finished = true;
                return;
            }
        }

        let envelope = match self.fetch_page(page).await {
            Ok(envelope) => envelope,
            Err(abort) => {
                warn!(run_id = %self.run_id, page, error = %abort, "pagination stopped");
                self.stats.abort = Some(abort);
                self.finished = true;
                return;
            }
        };

        self.stats.pages_fetched += 1;
        self.stats.records_skipped += envelope.skipped as u64;
        self.next_page += 1;

        if page == 0 {
            let expected = total_pages(envelope.records_total, self.source.query.page_size);
            self.stats.pages_expected = Some(expected);
            self.stats.records_reported = Some(envelope.records_total);
            info!(
                run_id = %self.run_id,
                records_total = envelope.records_total,
                pages = expected,
                "pagination started"
            );
            if expected == 0 {
                self.finished = true;
                return;
            }
        }

        debug!(
            run_id = %self.run_id,
            page,
            records = envelope.records.len(),
            skipped = envelope.skipped,
            "page decoded"
        );
        self.buffered.extend(envelope.records);
    }

    async fn fetch_page(&self, page: u64) -> Result<PageEnvelope, PaginationAbort> {
        let params = build_query_params(&self.source.query, page, self.start, self.end);
        let json = self
            .source
            .fetcher
            .fetch_json(self.run_id, &self.source.endpoint, &params)
            .await
            .map_err(|err| PaginationAbort::Transport {
                page,
                message: err.to_string(),
            })?;
        decode_page(json).map_err(|err| PaginationAbort::Schema {
            page,
            message: err.to_string(),
        })
    }
}
