/// Offline Verification - Dump, Shard Execution, Ingest
///
/// Splits a verification run into three steps so execution can scale out
/// without shared sandbox infrastructure:
/// 1. `dump_tasks`: write one TaskRecord per eligible candidate (no execution)
/// 2. `run_shard`: worker `rank` of `world` processes every line whose index
///    modulo `world` equals `rank`, writing one ResultRecord per line
/// 3. `ingest_results`: persist result files through the same batched writer
///    the online path uses
use anyhow::{bail, Context};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, error, info, instrument, warn};
use verifier_common::types::{CandidateUpdate, ResultRecord, StatusFilter, TaskRecord};
use verifier_common::{stream_candidates_with_problems, Store};

use crate::executor::Executor;
use crate::orchestrator::{BatchWriter, RunSummary};

/// Whether line `index` belongs to worker `rank` of `world`.
pub fn owns_line(index: usize, rank: usize, world: usize) -> bool {
    index % world == rank
}

/// One raw line as text, without its trailing `\r`.
fn decode_line(mut bytes: Vec<u8>) -> Result<String, std::string::FromUtf8Error> {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    String::from_utf8(bytes)
}

pub fn result_file_name(rank: usize, world: usize) -> String {
    format!("results-{:06}-{:06}.jsonl", rank, world)
}

/// What the dump step writes for each candidate.
#[derive(Debug, Clone)]
pub struct DumpSettings {
    pub statuses: StatusFilter,
    pub limit: Option<usize>,
    pub offset: usize,
    pub reader_workers: usize,
    pub language: String,
    pub import_string: String,
}

/// Write one task line per eligible candidate. Returns the number written.
#[instrument(skip_all, fields(path = %path.display(), statuses = %settings.statuses))]
pub async fn dump_tasks(
    store: Arc<dyn Store>,
    settings: &DumpSettings,
    path: &Path,
) -> anyhow::Result<usize> {
    let file = File::create(path)
        .await
        .with_context(|| format!("Failed to create task file {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let mut tasks = stream_candidates_with_problems(
        store,
        settings.statuses.clone(),
        settings.limit,
        settings.offset,
        settings.reader_workers.max(1),
    );

    let mut written = 0usize;
    while let Some(item) = tasks.recv().await {
        let task = match item {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, "Candidate stream failed");
                continue;
            }
        };

        // null marks a missing problem; a present problem with no data must
        // still parse as "no test cases"
        let test_cases = match task.problem {
            Some(problem) if problem.test_cases.is_null() => json!({}),
            Some(problem) => problem.test_cases,
            None => Value::Null,
        };
        let record = TaskRecord {
            id: task.candidate.id,
            problem_id: task.candidate.problem_id,
            code: task.candidate.extracted_code,
            language: settings.language.clone(),
            test_cases,
            import_string: settings.import_string.clone(),
        };

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        out.write_all(line.as_bytes()).await?;
        written += 1;
    }

    out.flush().await?;
    info!(tasks = written, "Tasks dumped");
    Ok(written)
}

/// Process this worker's share of a task file.
///
/// Results are written in task order and flushed after every record, so a
/// crashed worker leaves a valid prefix behind. Malformed lines are skipped.
#[instrument(skip(executor, tasks_path, output_dir), fields(tasks = %tasks_path.display()))]
pub async fn run_shard(
    executor: Arc<Executor>,
    tasks_path: &Path,
    rank: usize,
    world: usize,
    output_dir: &Path,
    concurrency: usize,
) -> anyhow::Result<(PathBuf, RunSummary)> {
    if world == 0 || rank >= world {
        bail!("Rank {} must be between 0 and {}", rank, world.saturating_sub(1));
    }

    let input = File::open(tasks_path)
        .await
        .with_context(|| format!("Failed to open task file {}", tasks_path.display()))?;
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;
    let output_path = output_dir.join(result_file_name(rank, world));
    let mut output = File::create(&output_path)
        .await
        .with_context(|| format!("Failed to create result file {}", output_path.display()))?;

    info!(rank, world, output = %output_path.display(), "Worker starting");

    let executor = &executor;
    // Byte lines keep the numbering intact when a line is not valid UTF-8
    let results = SplitStream::new(BufReader::new(input).split(b'\n'))
        .enumerate()
        .filter(|(index, _)| futures_util::future::ready(owns_line(*index, rank, world)))
        .filter_map(|(index, line)| async move {
            let bytes = match line {
                Ok(bytes) => bytes,
                Err(e) => return Some(Err(e)),
            };
            let line = match decode_line(bytes) {
                Ok(line) => line,
                Err(e) => {
                    warn!(line = index, error = %e, "Skipping task line that is not UTF-8");
                    return None;
                }
            };
            match serde_json::from_str::<TaskRecord>(&line) {
                Ok(task) => Some(Ok(task)),
                Err(e) => {
                    warn!(line = index, error = %e, "Skipping malformed task");
                    None
                }
            }
        })
        .map(|task| async move {
            match task {
                Ok(task) => Ok(executor.verify_task_record(&task).await),
                Err(e) => Err(e),
            }
        })
        .buffered(concurrency.max(1));
    let mut results = std::pin::pin!(results);

    let mut summary = RunSummary::default();
    while let Some(result) = results.next().await {
        let record = result.context("Failed to read task file")?;
        summary.record(record.verification_status);
        debug!(candidate_id = %record.id, status = %record.verification_status, "Task verified");

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
        summary.written += 1;
    }

    info!(
        rank,
        processed = summary.processed,
        passed = summary.passed,
        failed = summary.failed,
        errors = summary.error,
        skipped = summary.skipped,
        output = %output_path.display(),
        "Worker finished"
    );
    Ok((output_path, summary))
}

/// Persist result files with the online path's batching.
#[instrument(skip_all, fields(files = paths.len(), dry_run = dry_run))]
pub async fn ingest_results(
    store: Arc<dyn Store>,
    paths: &[PathBuf],
    batch_size: usize,
    dry_run: bool,
    failure_log: Option<&Path>,
) -> anyhow::Result<RunSummary> {
    let mut writer = BatchWriter::new(store, batch_size, dry_run, failure_log).await?;

    for path in paths {
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open result file {}", path.display()))?;
        let mut lines = BufReader::new(file).split(b'\n');
        let mut index = 0usize;

        info!(path = %path.display(), "Ingesting results");
        while let Some(bytes) = lines
            .next_segment()
            .await
            .with_context(|| format!("Failed to read result file {}", path.display()))?
        {
            index += 1;
            let line = match decode_line(bytes) {
                Ok(line) => line,
                Err(e) => {
                    warn!(path = %path.display(), line = index, error = %e, "Skipping result line that is not UTF-8");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ResultRecord>(&line) {
                Ok(record) => writer.push(CandidateUpdate::from(record)).await,
                Err(e) => warn!(path = %path.display(), line = index, error = %e, "Skipping malformed result"),
            }
        }
    }

    Ok(writer.finish().await)
}
