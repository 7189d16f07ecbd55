//! One incremental ingestion run: watermark, paginate, upsert, batch commits.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use fnet_adapters::{PageSource, PaginationStats};
use fnet_storage::{DocumentStore, StoreError, StoreSession, UpsertOutcome};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_COMMIT_THRESHOLD: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Resuming,
    Streaming,
    Committing,
    FinalCommit,
    Done,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Resuming => "resuming",
            Self::Streaming => "streaming",
            Self::Committing => "committing",
            Self::FinalCommit => "final_commit",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of [`IngestOrchestrator::run_once`]. `phase` is either
/// [`RunPhase::Done`] or [`RunPhase::Failed`].
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase: RunPhase,
    /// Phase that was active when the run failed.
    pub failed_in: Option<RunPhase>,
    pub error: Option<String>,
    pub resume_from: Option<NaiveDateTime>,
    pub records_seen: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Records covered by a successful commit.
    pub records_committed: u64,
    pub periodic_commits: u64,
    pub final_commit: bool,
    pub pagination: PaginationStats,
}

impl IngestReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            phase: RunPhase::Init,
            failed_in: None,
            error: None,
            resume_from: None,
            records_seen: 0,
            inserted: 0,
            updated: 0,
            records_committed: 0,
            periodic_commits: 0,
            final_commit: false,
            pagination: PaginationStats::default(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.phase == RunPhase::Done
    }

    /// Done, but pagination stopped before the last expected page.
    pub fn stopped_early(&self) -> bool {
        self.succeeded() && !self.pagination.completed()
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "run {} {}: seen={} inserted={} updated={} committed={} periodic_commits={} pages={}/{} skipped={}",
            self.run_id,
            self.phase,
            self.records_seen,
            self.inserted,
            self.updated,
            self.records_committed,
            self.periodic_commits,
            self.pagination.pages_fetched,
            self.pagination
                .pages_expected
                .map_or_else(|| "?".to_string(), |p| p.to_string()),
            self.pagination.records_skipped,
        );
        if let Some(abort) = &self.pagination.abort {
            line.push_str(&format!(" stopped=\"{abort}\""));
        }
        if let (Some(phase), Some(error)) = (self.failed_in, &self.error) {
            line.push_str(&format!(" failed_in={phase} error=\"{error}\""));
        }
        line
    }
}

/// Drives a [`PageSource`] into a [`DocumentStore`], resuming from the
/// store's delivery watermark.
pub struct IngestOrchestrator<S> {
    store: S,
    source: PageSource,
    commit_threshold: usize,
    end_date: Option<NaiveDate>,
}

impl<S: DocumentStore> IngestOrchestrator<S> {
    pub fn new(store: S, source: PageSource) -> Self {
        Self {
            store,
            source,
            commit_threshold: DEFAULT_COMMIT_THRESHOLD,
            end_date: None,
        }
    }

    pub fn with_commit_threshold(mut self, threshold: usize) -> Self {
        self.commit_threshold = threshold.max(1);
        self
    }

    /// Upper delivery-date bound sent as `dataFinal`.
    pub fn with_end_date(mut self, end_date: Option<NaiveDate>) -> Self {
        self.end_date = end_date;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one ingestion pass. Store failures roll back the open batch and
    /// come back as a failed report; batches committed earlier stay.
    pub async fn run_once(&self) -> IngestReport {
        self.run_with_end_date(self.end_date).await
    }

    /// [`Self::run_once`] with an explicit `dataFinal` bound for this run.
    pub async fn run_with_end_date(&self, end_date: Option<NaiveDate>) -> IngestReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id);
        self.run(run_id, end_date).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, end_date: Option<NaiveDate>) -> IngestReport {
        let mut report = IngestReport::new(run_id);

        let mut session = match self.store.begin().await {
            Ok(session) => session,
            Err(err) => return fail(report, RunPhase::Init, err),
        };

        report.phase = RunPhase::Resuming;
        let watermark = match self.store.last_delivery_timestamp().await {
            Ok(watermark) => watermark,
            Err(err) => return abort(session, report, err).await,
        };
        report.resume_from = watermark;
        let start = watermark.map(|ts| ts.date());
        info!(resume_from = ?watermark, end = ?end_date, "resuming");

        report.phase = RunPhase::Streaming;
        let mut cursor = self.source.enumerate(run_id, start, end_date);
        let mut pending = 0_u64;
        while let Some(record) = cursor.next_record().await {
            match session.upsert(&record).await {
                Ok(UpsertOutcome::Inserted) => report.inserted += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Err(err) => {
                    report.pagination = cursor.into_stats();
                    return abort(session, report, err).await;
                }
            }
            report.records_seen += 1;
            pending += 1;

            if pending == self.commit_threshold as u64 {
                report.phase = RunPhase::Committing;
                info!(records_seen = report.records_seen, "committing batch of {pending}");
                if let Err(err) = session.commit().await {
                    report.pagination = cursor.into_stats();
                    return abort(session, report, err).await;
                }
                report.records_committed += pending;
                report.periodic_commits += 1;
                pending = 0;
                report.phase = RunPhase::Streaming;
            }
        }
        report.pagination = cursor.into_stats();

        report.phase = RunPhase::FinalCommit;
        info!(records_seen = report.records_seen, "final commit of {pending}");
        if let Err(err) = session.commit().await {
            return abort(session, report, err).await;
        }
        report.records_committed += pending;
        report.final_commit = true;
        report.phase = RunPhase::Done;
        report.finished_at = Utc::now();

        if let Some(stop) = &report.pagination.abort {
            warn!(reason = %stop, records_seen = report.records_seen, "run finished after pagination stopped early");
        }
        info!(
            records_seen = report.records_seen,
            inserted = report.inserted,
            updated = report.updated,
            periodic_commits = report.periodic_commits,
            "run done"
        );
        report
    }
}

async fn abort<T: StoreSession>(mut session: T, report: IngestReport, err: StoreError) -> IngestReport {
    let phase = report.phase;
    if let Err(rollback_err) = session.rollback().await {
        warn!(error = %rollback_err, "rollback failed; dropping the session");
    }
    fail(report, phase, err)
}

fn fail(mut report: IngestReport, phase: RunPhase, err: StoreError) -> IngestReport {
    error!(
        %phase,
        error = %err,
        records_seen = report.records_seen,
        records_committed = report.records_committed,
        "run failed"
    );
    report.failed_in = Some(phase);
    report.error = Some(err.to_string());
    report.phase = RunPhase::Failed;
    report.finished_at = Utc::now();
    report
}
