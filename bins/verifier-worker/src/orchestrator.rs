/// Verification Orchestrator - Online Mode
///
/// **Flow:**
/// 1. Reader tasks stream eligible candidates joined with their problems
///    into a bounded queue (backpressure: readers block when it is full)
/// 2. Each task waits for a semaphore slot, then verifies one candidate
/// 3. Verdicts are buffered and written in batches, in completion order
///
/// **Guarantees:**
/// - At most `concurrency` candidates are verified at once
/// - A failing record never aborts the run
/// - Transient store contention leaves records unwritten (still pending)
/// - Dry runs verify everything and write nothing
///
/// Nothing claims a candidate before verifying it. Two orchestrators pointed
/// at the same store can verify the same record twice.
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use verifier_common::config::{DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY};
use verifier_common::types::{CandidateUpdate, StatusFilter, Verdict, VerificationStatus};
use verifier_common::{stream_candidates_with_problems, Store};

use crate::executor::Executor;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub statuses: StatusFilter,
    pub limit: Option<usize>,
    pub offset: usize,
    pub concurrency: usize,
    pub reader_workers: usize,
    pub batch_size: usize,
    pub dry_run: bool,
    pub failure_log: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            statuses: StatusFilter::default(),
            limit: None,
            offset: 0,
            concurrency: DEFAULT_CONCURRENCY,
            reader_workers: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
            failure_log: None,
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub passed: usize,
    pub failed: usize,
    pub error: usize,
    pub skipped: usize,
    /// Records persisted to the store.
    pub written: usize,
    /// Records left unwritten because the store was contended.
    pub deferred: usize,
    /// Records lost to non-transient write failures.
    pub write_errors: usize,
    /// Store read failures reported by the candidate stream.
    pub read_errors: usize,
}

impl RunSummary {
    pub(crate) fn record(&mut self, status: VerificationStatus) {
        self.processed += 1;
        match status {
            VerificationStatus::Passed => self.passed += 1,
            VerificationStatus::Failed => self.failed += 1,
            VerificationStatus::Error => self.error += 1,
            VerificationStatus::Skipped => self.skipped += 1,
            VerificationStatus::Pending => {}
        }
    }

    fn rate(&self, count: usize) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            count as f64 * 100.0 / self.processed as f64
        }
    }

    pub fn log_progress(&self) {
        info!(
            processed = self.processed,
            passed = %format!("{} ({:.1}%)", self.passed, self.rate(self.passed)),
            failed = %format!("{} ({:.1}%)", self.failed, self.rate(self.failed)),
            errors = %format!("{} ({:.1}%)", self.error, self.rate(self.error)),
            skipped = self.skipped,
            "Progress"
        );
    }
}

#[derive(Serialize)]
struct FailureLogEntry<'a> {
    id: &'a str,
    status: VerificationStatus,
    error: Option<String>,
    logged_at: DateTime<Utc>,
}

/// Buffers verdicts and writes them in batches.
pub struct BatchWriter {
    store: Arc<dyn Store>,
    batch_size: usize,
    dry_run: bool,
    pending: Vec<CandidateUpdate>,
    failure_log: Option<File>,
    summary: RunSummary,
}

impl BatchWriter {
    pub async fn new(
        store: Arc<dyn Store>,
        batch_size: usize,
        dry_run: bool,
        failure_log: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let failure_log = match failure_log {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("Failed to open failure log {}", path.display()))?,
            ),
            None => None,
        };

        Ok(Self {
            store,
            batch_size: batch_size.max(1),
            dry_run,
            pending: Vec::with_capacity(batch_size.max(1)),
            failure_log,
            summary: RunSummary::default(),
        })
    }

    pub fn note_read_error(&mut self) {
        self.summary.read_errors += 1;
    }

    pub async fn push(&mut self, update: CandidateUpdate) {
        self.summary.record(update.verification_status);

        if matches!(
            update.verification_status,
            VerificationStatus::Failed | VerificationStatus::Error
        ) {
            self.log_failure(&update).await;
        }

        self.pending.push(update);
        if self.pending.len() >= self.batch_size {
            self.flush().await;
        }
    }

    async fn log_failure(&mut self, update: &CandidateUpdate) {
        let error = update.verification_details.first_error();
        if self.dry_run {
            warn!(
                candidate_id = %update.id,
                status = %update.verification_status,
                error = error.as_deref().unwrap_or(""),
                "Would record failure"
            );
        }

        let Some(file) = self.failure_log.as_mut() else {
            return;
        };
        let entry = FailureLogEntry {
            id: &update.id,
            status: update.verification_status,
            error,
            logged_at: Utc::now(),
        };
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(candidate_id = %update.id, error = %e, "Failed to encode failure log entry");
                return;
            }
        };
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!(error = %e, "Failed to write failure log");
        }
    }

    /// Write buffered updates. Failures are counted, never raised.
    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);

        if self.dry_run {
            debug!(batch = batch.len(), "Dry run, discarding batch");
        } else {
            match self.store.update_batch(&batch).await {
                Ok(()) => {
                    self.summary.written += batch.len();
                    debug!(batch = batch.len(), "Batch written");
                }
                Err(e) if e.is_transient() => {
                    self.summary.deferred += batch.len();
                    warn!(batch = batch.len(), error = %e, "Store busy, records left for a later pass");
                }
                Err(e) => {
                    self.summary.write_errors += batch.len();
                    error!(batch = batch.len(), error = %e, "Failed to write batch");
                }
            }
        }

        self.summary.log_progress();
    }

    pub async fn finish(mut self) -> RunSummary {
        self.flush().await;
        if let Some(file) = self.failure_log.as_mut() {
            if let Err(e) = file.flush().await {
                warn!(error = %e, "Failed to flush failure log");
            }
        }
        self.summary
    }
}

/// Verify every eligible candidate and persist the verdicts.
#[instrument(skip_all, fields(statuses = %settings.statuses, concurrency = settings.concurrency, dry_run = settings.dry_run))]
pub async fn run_online(
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    settings: &OrchestratorSettings,
) -> anyhow::Result<RunSummary> {
    info!(limit = ?settings.limit, offset = settings.offset, "Fetching candidates");

    let mut tasks = stream_candidates_with_problems(
        store.clone(),
        settings.statuses.clone(),
        settings.limit,
        settings.offset,
        settings.reader_workers.max(1),
    );
    let mut writer = BatchWriter::new(
        store,
        settings.batch_size,
        settings.dry_run,
        settings.failure_log.as_deref(),
    )
    .await?;

    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
    let mut in_flight: JoinSet<(String, Verdict)> = JoinSet::new();

    while let Some(item) = tasks.recv().await {
        let task = match item {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, "Candidate stream failed");
                writer.note_read_error();
                continue;
            }
        };

        let permit = semaphore.clone().acquire_owned().await?;
        while let Some(joined) = in_flight.try_join_next() {
            record_verdict(joined, &mut writer).await;
        }

        let executor = executor.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            let verdict = executor.verify(&task).await;
            (task.candidate.id, verdict)
        });
    }

    while let Some(joined) = in_flight.join_next().await {
        record_verdict(joined, &mut writer).await;
    }

    let summary = writer.finish().await;
    if summary.processed == 0 {
        info!("No unverified candidates found");
    }
    info!(
        passed = summary.passed,
        failed = summary.failed,
        errors = summary.error,
        skipped = summary.skipped,
        deferred = summary.deferred,
        total = summary.processed,
        "Verification complete"
    );
    Ok(summary)
}

async fn record_verdict(
    joined: Result<(String, Verdict), tokio::task::JoinError>,
    writer: &mut BatchWriter,
) {
    match joined {
        Ok((candidate_id, verdict)) => {
            debug!(candidate_id = %candidate_id, status = %verdict.status, "Candidate verified");
            writer
                .push(CandidateUpdate::from_verdict(candidate_id, verdict))
                .await;
        }
        Err(e) => error!(error = %e, "Verification task panicked"),
    }
}
