use chrono::NaiveDate;
use fnet_core::DocumentRecord;
use fnet_storage::{DocumentStore, PgDocumentStore, StoreSession, UpsertOutcome};

// Each test uses its own document id range so runs against a shared database
// do not interfere.
async fn store_from_env() -> Option<PgDocumentStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let store = PgDocumentStore::connect(&url, 2).await.expect("connect");
    store.migrate().await.expect("migrate");
    Some(store)
}

async fn clear_range(store: &PgDocumentStore, low: i64, high: i64) {
    sqlx::query("DELETE FROM fnet_documents WHERE document_id BETWEEN $1 AND $2")
        .bind(low)
        .bind(high)
        .execute(store.pool())
        .await
        .expect("cleanup");
}

fn record(document_id: i64, status: &str) -> DocumentRecord {
    DocumentRecord {
        document_id,
        fund_description: "FII Example".into(),
        document_category: "Informes Periódicos".into(),
        document_type: "Rendimentos e Amortizações".into(),
        reference_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
        delivery_timestamp: NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(18, 30, 0)
            .unwrap(),
        status: status.into(),
        status_description: "Ativo com visualização".into(),
        review_flag: "N".into(),
        situation: "A".into(),
        high_priority: false,
        reference_date_format: "3".into(),
        version: 1,
        modality: "AP".into(),
        modality_description: "Apresentação".into(),
        auction_name: "FII EXAMPLE".into(),
        extra_info: String::new(),
        template_id: 0,
        convenio_item_id: 0,
        active_on_exchange: true,
    }
}

#[tokio::test]
async fn re_delivered_record_updates_the_existing_row() {
    let Some(store) = store_from_env().await else {
        return;
    };
    clear_range(&store, 900_000_007, 900_000_007).await;

    let mut session = store.begin().await.unwrap();
    assert_eq!(
        session.upsert(&record(900_000_007, "A")).await.unwrap(),
        UpsertOutcome::Inserted
    );
    session.commit().await.unwrap();

    assert_eq!(
        session.upsert(&record(900_000_007, "B")).await.unwrap(),
        UpsertOutcome::Updated
    );
    session.commit().await.unwrap();

    let stored = store
        .fetch_document(record(900_000_007, "B").natural_key())
        .await
        .unwrap()
        .expect("row exists");
    assert_eq!(stored.record.status, "B");
    assert!(stored.last_update.is_some());

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM fnet_documents WHERE document_id = $1")
            .bind(900_000_007_i64)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn repeated_upsert_keeps_fields_and_advances_last_update() {
    let Some(store) = store_from_env().await else {
        return;
    };
    clear_range(&store, 900_000_100, 900_000_100).await;
    let doc = record(900_000_100, "AC");

    let mut session = store.begin().await.unwrap();
    session.upsert(&doc).await.unwrap();
    session.commit().await.unwrap();
    session.upsert(&doc).await.unwrap();
    session.commit().await.unwrap();
    let first = store.fetch_document(doc.natural_key()).await.unwrap().unwrap();

    session.upsert(&doc).await.unwrap();
    session.commit().await.unwrap();
    let second = store.fetch_document(doc.natural_key()).await.unwrap().unwrap();

    assert_eq!(second.record, doc);
    assert_eq!(second.inserted_at, first.inserted_at);
    assert!(second.last_update >= first.last_update);
}

#[tokio::test]
async fn rolled_back_batch_leaves_no_rows() {
    let Some(store) = store_from_env().await else {
        return;
    };
    clear_range(&store, 900_000_200, 900_000_201).await;

    let mut session = store.begin().await.unwrap();
    session.upsert(&record(900_000_200, "AC")).await.unwrap();
    session.commit().await.unwrap();
    session.upsert(&record(900_000_201, "AC")).await.unwrap();
    session.rollback().await.unwrap();

    assert!(store
        .fetch_document(record(900_000_200, "AC").natural_key())
        .await
        .unwrap()
        .is_some());
    assert!(store
        .fetch_document(record(900_000_201, "AC").natural_key())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn watermark_covers_committed_rows() {
    let Some(store) = store_from_env().await else {
        return;
    };
    clear_range(&store, 900_000_300, 900_000_300).await;

    let mut doc = record(900_000_300, "AC");
    doc.delivery_timestamp = NaiveDate::from_ymd_opt(2999, 12, 31)
        .unwrap()
        .and_hms_opt(23, 59, 0)
        .unwrap();
    let mut session = store.begin().await.unwrap();
    session.upsert(&doc).await.unwrap();
    session.commit().await.unwrap();

    assert_eq!(
        store.last_delivery_timestamp().await.unwrap(),
        Some(doc.delivery_timestamp)
    );
    clear_range(&store, 900_000_300, 900_000_300).await;
}

#[tokio::test]
async fn id_chunks_walk_in_order_and_skip_excluded_ids() {
    let Some(store) = store_from_env().await else {
        return;
    };
    clear_range(&store, 900_000_400, 900_000_405).await;

    let mut session = store.begin().await.unwrap();
    for id in 900_000_400..=900_000_405 {
        session.upsert(&record(id, "AC")).await.unwrap();
    }
    // a second reference date for the same id must not repeat it
    let mut other_month = record(900_000_401, "AC");
    other_month.reference_date = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
    session.upsert(&other_month).await.unwrap();
    session.commit().await.unwrap();

    // start just below the range so rows from other tests are not walked
    let mut walked = Vec::new();
    let mut after = Some(900_000_399);
    loop {
        let chunk = store
            .document_ids_after(after, &[900_000_402, 900_000_404], 2)
            .await
            .unwrap();
        let Some(&last) = chunk.last() else {
            break;
        };
        assert!(chunk.len() <= 2);
        walked.extend(chunk.into_iter().take_while(|id| *id <= 900_000_405));
        if last > 900_000_405 {
            break;
        }
        after = Some(last);
    }
    assert_eq!(walked, vec![900_000_400, 900_000_401, 900_000_403, 900_000_405]);

    let none_excluded = store
        .document_ids_after(Some(900_000_399), &[], 3)
        .await
        .unwrap();
    assert_eq!(none_excluded, vec![900_000_400, 900_000_401, 900_000_402]);

    clear_range(&store, 900_000_400, 900_000_405).await;
}
