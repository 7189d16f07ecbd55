//! Postgres-backed document store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use fnet_core::{DocumentRecord, NaturalKey, StoredDocument};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use crate::{DocumentStore, StoreError, StoreSession, UpsertOutcome};

// One atomic statement: the unique constraint arbitrates concurrent writers,
// so there is no separate existence check.
const UPSERT_DOCUMENT_SQL: &str = r#"
INSERT INTO fnet_documents (
    document_id,
    fund_description,
    document_category,
    document_type,
    reference_date,
    delivery_timestamp,
    status,
    status_description,
    review_flag,
    situation,
    high_priority,
    reference_date_format,
    version,
    modality,
    modality_description,
    auction_name,
    extra_info,
    template_id,
    convenio_item_id,
    active_on_exchange
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
ON CONFLICT ON CONSTRAINT uq_fnet_documents_natural_key
DO UPDATE SET
    fund_description = EXCLUDED.fund_description,
    document_category = EXCLUDED.document_category,
    document_type = EXCLUDED.document_type,
    delivery_timestamp = EXCLUDED.delivery_timestamp,
    status = EXCLUDED.status,
    status_description = EXCLUDED.status_description,
    review_flag = EXCLUDED.review_flag,
    situation = EXCLUDED.situation,
    high_priority = EXCLUDED.high_priority,
    reference_date_format = EXCLUDED.reference_date_format,
    version = EXCLUDED.version,
    modality = EXCLUDED.modality,
    modality_description = EXCLUDED.modality_description,
    auction_name = EXCLUDED.auction_name,
    extra_info = EXCLUDED.extra_info,
    template_id = EXCLUDED.template_id,
    convenio_item_id = EXCLUDED.convenio_item_id,
    active_on_exchange = EXCLUDED.active_on_exchange,
    last_update = clock_timestamp()
RETURNING (xmax = 0) AS inserted
"#;

const SELECT_DOCUMENT_SQL: &str = r#"
SELECT
    document_id,
    fund_description,
    document_category,
    document_type,
    reference_date,
    delivery_timestamp,
    status,
    status_description,
    review_flag,
    situation,
    high_priority,
    reference_date_format,
    version,
    modality,
    modality_description,
    auction_name,
    extra_info,
    template_id,
    convenio_item_id,
    active_on_exchange,
    inserted_at,
    last_update
FROM fnet_documents
WHERE document_id = $1 AND reference_date = $2
"#;

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations under `migrations/`.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("fnet_documents migrations applied");
        Ok(())
    }

    pub async fn fetch_document(&self, key: NaturalKey) -> Result<Option<StoredDocument>, StoreError> {
        let row = sqlx::query(SELECT_DOCUMENT_SQL)
            .bind(key.document_id)
            .bind(key.reference_date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_stored).transpose()?)
    }
}

fn row_to_stored(row: &PgRow) -> Result<StoredDocument, sqlx::Error> {
    Ok(StoredDocument {
        record: DocumentRecord {
            document_id: row.try_get("document_id")?,
            fund_description: row.try_get("fund_description")?,
            document_category: row.try_get("document_category")?,
            document_type: row.try_get("document_type")?,
            reference_date: row.try_get("reference_date")?,
            delivery_timestamp: row.try_get("delivery_timestamp")?,
            status: row.try_get("status")?,
            status_description: row.try_get("status_description")?,
            review_flag: row.try_get("review_flag")?,
            situation: row.try_get("situation")?,
            high_priority: row.try_get("high_priority")?,
            reference_date_format: row.try_get("reference_date_format")?,
            version: row.try_get("version")?,
            modality: row.try_get("modality")?,
            modality_description: row.try_get("modality_description")?,
            auction_name: row.try_get("auction_name")?,
            extra_info: row.try_get("extra_info")?,
            template_id: row.try_get("template_id")?,
            convenio_item_id: row.try_get("convenio_item_id")?,
            active_on_exchange: row.try_get("active_on_exchange")?,
        },
        inserted_at: row.try_get("inserted_at")?,
        last_update: row.try_get("last_update")?,
    })
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    type Session = PgSession;

    async fn begin(&self) -> Result<Self::Session, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(PgSession {
            pool: self.pool.clone(),
            tx: Some(tx),
        })
    }

    async fn last_delivery_timestamp(&self) -> Result<Option<NaiveDateTime>, StoreError> {
        let max: Option<NaiveDateTime> =
            sqlx::query_scalar("SELECT MAX(delivery_timestamp) FROM fnet_documents")
                .fetch_one(&self.pool)
                .await?;
        Ok(max)
    }

    async fn document_ids_after(
        &self,
        after: Option<i64>,
        exclude: &[i64],
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT document_id
            FROM fnet_documents
            WHERE ($1::BIGINT IS NULL OR document_id > $1)
              AND NOT (document_id = ANY($2))
            ORDER BY document_id
            LIMIT $3
            "#,
        )
        .bind(after)
        .bind(exclude)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

/// Owns at most one open transaction. A commit closes it and the next write
/// opens a fresh one; dropping the session rolls back whatever is open.
pub struct PgSession {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    async fn transaction(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };
        Ok(self.tx.insert(tx))
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn upsert(&mut self, record: &DocumentRecord) -> Result<UpsertOutcome, StoreError> {
        let tx = self.transaction().await?;
        let inserted: bool = sqlx::query_scalar(UPSERT_DOCUMENT_SQL)
            .bind(record.document_id)
            .bind(&record.fund_description)
            .bind(&record.document_category)
            .bind(&record.document_type)
            .bind(record.reference_date)
            .bind(record.delivery_timestamp)
            .bind(&record.status)
            .bind(&record.status_description)
            .bind(&record.review_flag)
            .bind(&record.situation)
            .bind(record.high_priority)
            .bind(&record.reference_date_format)
            .bind(record.version)
            .bind(&record.modality)
            .bind(&record.modality_description)
            .bind(&record.auction_name)
            .bind(&record.extra_info)
            .bind(record.template_id)
            .bind(record.convenio_item_id)
            .bind(record.active_on_exchange)
            .fetch_one(&mut **tx)
            .await?;

        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
