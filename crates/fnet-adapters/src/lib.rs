//! Registry page decoding, pagination and XML disclosure decoding.

use thiserror::Error;

mod disclosure;
mod pages;
mod records;

pub use disclosure::{decode_disclosure, load_disclosure};
pub use pages::{
    build_query_params, total_pages, DeliveryOrder, PageCursor, PageSource, PaginationAbort,
    PaginationStats, RegistryQuery, DEFAULT_DOCUMENT_CATEGORY, DEFAULT_ENDPOINT,
    DEFAULT_FUND_TYPE, DEFAULT_PAGE_SIZE,
};
pub use records::{decode_page, decode_record, parse_lax_bool};

pub const CRATE_NAME: &str = "fnet-adapters";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid page envelope: {0}")]
    Envelope(String),
    #[error("invalid record at index {index} (id {document_id:?}): {reason}")]
    Record {
        index: usize,
        document_id: Option<i64>,
        reason: String,
    },
    #[error("malformed xml: {0}")]
    Xml(String),
    #[error("missing element {0}")]
    MissingElement(&'static str),
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
