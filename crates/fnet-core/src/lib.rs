//! Core domain model for the FNET document registry sync.

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "fnet-core";

/// Date format the registry expects for `dataInicial` / `dataFinal`.
pub const QUERY_DATE_FORMAT: &str = "%d/%m/%Y";

/// One disclosure document entry as delivered by the registry.
///
/// `document_id` alone is not unique: the registry re-delivers a document under
/// a new reference date, so identity is the pair returned by [`DocumentRecord::natural_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: i64,
    pub fund_description: String,
    pub document_category: String,
    pub document_type: String,
    pub reference_date: NaiveDate,
    pub delivery_timestamp: NaiveDateTime,
    pub status: String,
    pub status_description: String,
    pub review_flag: String,
    pub situation: String,
    pub high_priority: bool,
    pub reference_date_format: String,
    pub version: i32,
    pub modality: String,
    pub modality_description: String,
    pub auction_name: String,
    pub extra_info: String,
    pub template_id: i32,
    pub convenio_item_id: i32,
    pub active_on_exchange: bool,
}

impl DocumentRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            document_id: self.document_id,
            reference_date: self.reference_date,
        }
    }
}

/// Business uniqueness tuple of a persisted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub document_id: i64,
    pub reference_date: NaiveDate,
}

/// A document as read back from a store, with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub record: DocumentRecord,
    pub inserted_at: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
}

/// One decoded page response. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEnvelope {
    pub records_total: u64,
    pub records_filtered: u64,
    pub records: Vec<DocumentRecord>,
    /// Records dropped by the decoder because they failed validation.
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unidentified format: {0}")]
pub struct DateParseError(pub String);

/// Parse the date shapes the registry and the disclosure XML use:
/// `yyyy-mm-dd`, `dd/mm/yyyy` and `dd/mm/yyyy HH:MM`.
pub fn parse_date_string(input: &str) -> Result<NaiveDateTime, DateParseError> {
    let trimmed = input.trim();
    for format in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Ok(date.and_time(NaiveTime::default()));
        }
    }
    NaiveDateTime::parse_from_str(trimmed, "%d/%m/%Y %H:%M")
        .map_err(|_| DateParseError(input.to_string()))
}

pub fn parse_date(input: &str) -> Result<NaiveDate, DateParseError> {
    parse_date_string(input).map(|dt| dt.date())
}

pub fn format_query_date(date: NaiveDate) -> String {
    date.format(QUERY_DATE_FORMAT).to_string()
}

/// Strip every non-word character (anything but letters, digits and `_`).
pub fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

/// General fund identification block of an economic-financial disclosure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralData {
    pub fund_name: String,
    pub fund_cnpj: String,
    pub administrator_name: String,
    pub administrator_cnpj: String,
    pub contact_person: String,
    pub contact_phone: String,
    pub quota_isin_code: String,
    pub quota_ticker: String,
}

/// Income distribution announced per quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomeDistribution {
    pub approval_act: Option<String>,
    pub approval_date: Option<NaiveDate>,
    pub base_date: NaiveDate,
    pub payment_date: NaiveDate,
    pub amount_per_quota: BigDecimal,
    pub reference_period: String,
    pub year: String,
    pub income_tax_exempt: bool,
}

/// Capital amortization announced per quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amortization {
    pub approval_act: Option<String>,
    pub approval_date: Option<NaiveDate>,
    pub base_date: NaiveDate,
    pub payment_date: NaiveDate,
    pub amount_per_quota: BigDecimal,
    pub reference_period: String,
    pub year: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomeReport {
    pub amortization: Option<Amortization>,
    pub income: Option<IncomeDistribution>,
}

/// Typed form of a `DadosEconomicoFinanceiros` XML payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EconomicFinancialData {
    pub general: GeneralData,
    pub income_report: IncomeReport,
}
