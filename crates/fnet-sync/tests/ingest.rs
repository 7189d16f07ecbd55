use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime};
use fnet_adapters::{PageSource, PaginationAbort, RegistryQuery};
use fnet_core::DocumentRecord;
use fnet_storage::{
    DocumentStore, HttpClientConfig, HttpFetcher, InMemoryDocumentStore, InMemorySession,
    StoreError, StoreSession, UpsertOutcome,
};
use fnet_sync::{IngestOrchestrator, RunPhase, SyncConfig, SyncPipeline};
use serde_json::{json, Value};
use wiremock::matchers::{method, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn raw_record(id: u64, delivered: &str) -> Value {
    json!({
        "id": id,
        "descricaoFundo": "FII Example",
        "categoriaDocumento": "Informes Periódicos",
        "tipoDocumento": "Rendimentos e Amortizações",
        "dataReferencia": "10/01/2024",
        "dataEntrega": delivered,
        "status": "AC",
        "descricaoStatus": "Ativo com visualização",
        "analisado": "N",
        "situacaoDocumento": "A",
        "altaPrioridade": false,
        "formatoDataReferencia": "3",
        "versao": 1,
        "modalidade": "AP",
        "descricaoModalidade": "Apresentação",
        "nomePregao": "FII EXAMPLE",
        "informacoesAdicionais": "",
        "idTemplate": 0,
        "idSelectItemConvenio": 0,
        "indicadorFundoAtivoB3": true
    })
}

fn page_body(total: u64, ids: std::ops::Range<u64>) -> Value {
    json!({
        "draw": 1,
        "recordsTotal": total,
        "recordsFiltered": total,
        "data": ids.map(|id| raw_record(id, "10/01/2024 18:30")).collect::<Vec<_>>(),
    })
}

/// Serves `total` records in pages of 200.
async fn registry_with(total: u64) -> MockServer {
    let server = MockServer::start().await;
    let mut offset = 0;
    loop {
        let end = (offset + 200).min(total);
        Mock::given(method("GET"))
            .and(query_param("s", offset.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(total, offset..end)))
            .mount(&server)
            .await;
        offset += 200;
        if offset >= total {
            break;
        }
    }
    server
}

fn page_source(server: &MockServer) -> PageSource {
    let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    PageSource::new(fetcher, server.uri(), RegistryQuery::default())
}

fn has_param(request: &Request, key: &str) -> Option<String> {
    request
        .url
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn delivered(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn stored_record(document_id: i64, delivery_timestamp: NaiveDateTime) -> DocumentRecord {
    DocumentRecord {
        document_id,
        fund_description: "FII Seed".into(),
        document_category: "Informes Periódicos".into(),
        document_type: "Rendimentos e Amortizações".into(),
        reference_date: delivery_timestamp.date(),
        delivery_timestamp,
        status: "AC".into(),
        status_description: "Ativo".into(),
        review_flag: "N".into(),
        situation: "A".into(),
        high_priority: false,
        reference_date_format: "3".into(),
        version: 1,
        modality: "AP".into(),
        modality_description: "Apresentação".into(),
        auction_name: String::new(),
        extra_info: String::new(),
        template_id: 0,
        convenio_item_id: 0,
        active_on_exchange: true,
    }
}

#[tokio::test]
async fn full_backfill_commits_once_below_the_threshold() {
    let server = registry_with(450).await;
    let store = InMemoryDocumentStore::new();
    let orchestrator = IngestOrchestrator::new(store.clone(), page_source(&server));

    let report = orchestrator.run_once().await;

    assert_eq!(report.phase, RunPhase::Done);
    assert_eq!(report.records_seen, 450);
    assert_eq!(report.inserted, 450);
    assert_eq!(report.periodic_commits, 0);
    assert!(report.final_commit);
    assert_eq!(report.records_committed, 450);
    assert_eq!(report.pagination.pages_fetched, 3);
    assert_eq!(store.commit_count(), 1);
    assert_eq!(store.len(), 450);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| has_param(r, "dataInicial").is_none()));
}

#[tokio::test]
async fn commits_every_threshold_plus_a_final_one() {
    for (threshold, expected_periodic) in [(100_usize, 4_u64), (150, 3), (450, 1), (1, 450)] {
        let server = registry_with(450).await;
        let store = InMemoryDocumentStore::new();
        let orchestrator = IngestOrchestrator::new(store.clone(), page_source(&server))
            .with_commit_threshold(threshold);

        let report = orchestrator.run_once().await;

        assert!(report.succeeded(), "threshold {threshold}");
        assert_eq!(report.periodic_commits, expected_periodic, "threshold {threshold}");
        assert_eq!(store.commit_count() as u64, expected_periodic + 1, "threshold {threshold}");
        assert_eq!(report.records_committed, 450);
    }
}

#[tokio::test]
async fn resumes_from_the_persisted_watermark() {
    let server = registry_with(3).await;
    let store = InMemoryDocumentStore::with_documents([
        stored_record(9001, delivered(14, 9)),
        stored_record(9002, delivered(15, 10)),
    ]);
    let before = store.last_delivery_timestamp().await.unwrap();

    let orchestrator = IngestOrchestrator::new(store.clone(), page_source(&server))
        .with_end_date(NaiveDate::from_ymd_opt(2024, 3, 31));
    let report = orchestrator.run_once().await;

    assert!(report.succeeded());
    assert_eq!(report.resume_from, Some(delivered(15, 10)));
    let requests = server.received_requests().await.unwrap();
    assert_eq!(has_param(&requests[0], "dataInicial").as_deref(), Some("15/03/2024"));
    assert_eq!(has_param(&requests[0], "dataFinal").as_deref(), Some("31/03/2024"));

    let after = store.last_delivery_timestamp().await.unwrap();
    assert!(after >= before);
    assert_eq!(store.len(), 5);
}

#[tokio::test]
async fn rerunning_the_same_data_only_updates() {
    let server = registry_with(250).await;
    let store = InMemoryDocumentStore::new();
    let orchestrator = IngestOrchestrator::new(store.clone(), page_source(&server));

    let first = orchestrator.run_once().await;
    let snapshot = store.documents();
    let second = orchestrator.run_once().await;

    assert_eq!(first.inserted, 250);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 250);
    assert_eq!(store.len(), 250);
    let rerun = store.documents();
    for (a, b) in snapshot.iter().zip(rerun.iter()) {
        assert_eq!(a.record, b.record);
        assert_eq!(a.inserted_at, b.inserted_at);
        assert!(b.last_update.is_some());
    }
}

#[tokio::test]
async fn later_page_failure_keeps_what_was_already_streamed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("s", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(450, 0..200)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("s", "200"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let store = InMemoryDocumentStore::new();
    let orchestrator = IngestOrchestrator::new(store.clone(), page_source(&server));
    let report = orchestrator.run_once().await;

    assert!(report.succeeded());
    assert!(report.stopped_early());
    assert!(matches!(
        report.pagination.abort,
        Some(PaginationAbort::Transport { page: 1, .. })
    ));
    assert_eq!(report.records_committed, 200);
    assert_eq!(store.len(), 200);
}

#[tokio::test]
async fn unreachable_registry_is_a_completed_empty_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = InMemoryDocumentStore::new();
    let report = IngestOrchestrator::new(store.clone(), page_source(&server))
        .run_once()
        .await;

    assert!(report.succeeded());
    assert_eq!(report.records_seen, 0);
    assert!(report.final_commit);
    assert!(store.is_empty());
}

/// Wraps the in-memory store and injects persistence failures.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: InMemoryDocumentStore,
    fail_on_upsert: Option<u64>,
    fail_on_commit: Option<usize>,
    upserts: Arc<AtomicU64>,
    commits: Arc<AtomicUsize>,
}

struct FlakySession {
    inner: InMemorySession,
    store: FlakyStore,
}

fn injected() -> StoreError {
    StoreError::Database(sqlx::Error::Protocol("injected failure".into()))
}

#[async_trait]
impl DocumentStore for FlakyStore {
    type Session = FlakySession;

    async fn begin(&self) -> Result<Self::Session, StoreError> {
        Ok(FlakySession {
            inner: self.inner.begin().await?,
            store: self.clone(),
        })
    }

    async fn last_delivery_timestamp(&self) -> Result<Option<NaiveDateTime>, StoreError> {
        self.inner.last_delivery_timestamp().await
    }

    async fn document_ids_after(
        &self,
        after: Option<i64>,
        exclude: &[i64],
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        self.inner.document_ids_after(after, exclude, limit).await
    }
}

#[async_trait]
impl StoreSession for FlakySession {
    async fn upsert(&mut self, record: &DocumentRecord) -> Result<UpsertOutcome, StoreError> {
        let n = self.store.upserts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.store.fail_on_upsert == Some(n) {
            return Err(injected());
        }
        self.inner.upsert(record).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let n = self.store.commits.fetch_add(1, Ordering::SeqCst) + 1;
        if self.store.fail_on_commit == Some(n) {
            return Err(injected());
        }
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

#[tokio::test]
async fn upsert_failure_rolls_back_to_the_last_commit() {
    let server = registry_with(450).await;
    let store = FlakyStore {
        fail_on_upsert: Some(250),
        ..FlakyStore::default()
    };
    let orchestrator =
        IngestOrchestrator::new(store.clone(), page_source(&server)).with_commit_threshold(100);

    let report = orchestrator.run_once().await;

    assert_eq!(report.phase, RunPhase::Failed);
    assert_eq!(report.failed_in, Some(RunPhase::Streaming));
    assert!(report.error.as_deref().unwrap().contains("injected failure"));
    assert_eq!(report.periodic_commits, 2);
    assert_eq!(report.records_committed, 200);
    assert_eq!(store.inner.len(), 200);
}

#[tokio::test]
async fn commit_failure_is_reported_with_its_phase() {
    let server = registry_with(450).await;
    let store = FlakyStore {
        fail_on_commit: Some(2),
        ..FlakyStore::default()
    };
    let orchestrator =
        IngestOrchestrator::new(store.clone(), page_source(&server)).with_commit_threshold(100);

    let report = orchestrator.run_once().await;

    assert_eq!(report.failed_in, Some(RunPhase::Committing));
    assert_eq!(report.records_committed, 100);
    assert_eq!(store.inner.len(), 100);
}

#[tokio::test]
async fn final_commit_failure_keeps_periodic_batches() {
    let server = registry_with(450).await;
    let store = FlakyStore {
        fail_on_commit: Some(5),
        ..FlakyStore::default()
    };
    let orchestrator =
        IngestOrchestrator::new(store.clone(), page_source(&server)).with_commit_threshold(100);

    let report = orchestrator.run_once().await;

    assert_eq!(report.failed_in, Some(RunPhase::FinalCommit));
    assert!(!report.final_commit);
    assert_eq!(store.inner.len(), 400);
}

#[tokio::test]
async fn pipeline_bounds_runs_by_today_and_skips_overlapping_ticks() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(page_body(2, 0..2))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let config = SyncConfig {
        endpoint: server.uri(),
        ..SyncConfig::default()
    };
    let store = InMemoryDocumentStore::new();
    let pipeline = SyncPipeline::new(config, store.clone()).unwrap();

    let (first, second) = tokio::join!(pipeline.try_run_once(), pipeline.try_run_once());
    assert!(first.expect("first tick runs").succeeded());
    assert!(second.is_none());
    assert_eq!(store.len(), 2);

    let requests = server.received_requests().await.unwrap();
    let today = Local::now().date_naive().format("%d/%m/%Y").to_string();
    assert_eq!(has_param(&requests[0], "dataFinal"), Some(today));
}
