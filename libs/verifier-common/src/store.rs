use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{Candidate, CandidateUpdate, Problem, StatusFilter, VerificationTask};

/// Capacity of the reader -> orchestrator queue. Readers block when it is full.
pub const READER_QUEUE_CAPACITY: usize = 1000;

/// Problems cached per reader before the cache is reset.
const PROBLEM_CACHE_LIMIT: usize = 1024;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer holds the record or the store is momentarily busy.
    #[error("store contention: {0}")]
    Contention(String),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Errors worth retrying on a later pass rather than recording as failures.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Contention(_) => true,
            StoreError::Redis(e) => {
                e.is_timeout()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
                    )
                    || e.code() == Some("BUSY")
            }
            StoreError::Serialization(_) | StoreError::Io(_) => false,
        }
    }
}

/// Read/write surface the verifier needs from candidate storage.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_problem(&self, id: &str) -> StoreResult<Option<Problem>>;

    /// Candidates whose status matches `statuses`, in storage order, after
    /// skipping `offset` matches and yielding at most `limit`.
    fn stream_candidates<'a>(
        &'a self,
        statuses: &'a StatusFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> BoxStream<'a, StoreResult<Candidate>>;

    async fn update(&self, update: &CandidateUpdate) -> StoreResult<()>;

    /// Apply every update or none of them.
    async fn update_batch(&self, updates: &[CandidateUpdate]) -> StoreResult<()>;
}

/// Split `[offset, offset + limit)` into one range per reader.
pub fn reader_chunks(
    limit: Option<usize>,
    offset: usize,
    reader_workers: usize,
) -> Vec<(Option<usize>, usize)> {
    match limit {
        Some(limit) if reader_workers > 1 && limit > 0 => {
            let chunk = limit.div_ceil(reader_workers);
            (0..reader_workers)
                .map(|i| i * chunk)
                .take_while(|start| *start < limit)
                .map(|start| (Some(chunk.min(limit - start)), offset + start))
                .collect()
        }
        _ => vec![(limit, offset)],
    }
}

/// Stream candidates joined with their problems.
///
/// Reader tasks push onto a bounded channel, so a slow consumer throttles
/// reads. A candidate whose problem is missing is yielded with
/// `problem: None`. Reader failures are forwarded as `Err` items and end that
/// reader only.
pub fn stream_candidates_with_problems(
    store: Arc<dyn Store>,
    statuses: StatusFilter,
    limit: Option<usize>,
    offset: usize,
    reader_workers: usize,
) -> mpsc::Receiver<StoreResult<VerificationTask>> {
    let (tx, rx) = mpsc::channel(READER_QUEUE_CAPACITY);

    for (reader, (chunk_limit, chunk_offset)) in reader_chunks(limit, offset, reader_workers)
        .into_iter()
        .enumerate()
    {
        let store = store.clone();
        let statuses = statuses.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            debug!(reader, offset = chunk_offset, limit = ?chunk_limit, "Reader started");
            if let Err(e) = read_chunk(store.as_ref(), &statuses, chunk_limit, chunk_offset, &tx).await {
                warn!(reader, error = %e, "Reader failed");
                let _ = tx.send(Err(e)).await;
            }
        });
    }

    rx
}

async fn read_chunk(
    store: &dyn Store,
    statuses: &StatusFilter,
    limit: Option<usize>,
    offset: usize,
    tx: &mpsc::Sender<StoreResult<VerificationTask>>,
) -> StoreResult<()> {
    let mut problems: HashMap<String, Option<Problem>> = HashMap::new();
    let mut candidates = store.stream_candidates(statuses, limit, offset);

    while let Some(candidate) = candidates.next().await {
        let candidate = candidate?;

        let problem = match problems.get(&candidate.problem_id) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = store.get_problem(&candidate.problem_id).await?;
                if problems.len() >= PROBLEM_CACHE_LIMIT {
                    problems.clear();
                }
                problems.insert(candidate.problem_id.clone(), fetched.clone());
                fetched
            }
        };

        if tx.send(Ok(VerificationTask { candidate, problem })).await.is_err() {
            debug!("Task receiver dropped, stopping reader");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::types::VerificationStatus;
    use serde_json::json;

    fn candidate(id: &str, problem_id: &str, status: Option<VerificationStatus>) -> Candidate {
        Candidate {
            id: id.to_string(),
            problem_id: problem_id.to_string(),
            extracted_code: Some("print(1)".to_string()),
            verification_status: status,
            verification_details: None,
        }
    }

    #[test]
    fn test_reader_chunks_cover_range() {
        assert_eq!(reader_chunks(None, 5, 4), vec![(None, 5)]);
        assert_eq!(reader_chunks(Some(10), 0, 1), vec![(Some(10), 0)]);
        assert_eq!(
            reader_chunks(Some(10), 100, 3),
            vec![(Some(4), 100), (Some(4), 104), (Some(2), 108)]
        );
        // more readers than rows
        assert_eq!(
            reader_chunks(Some(2), 0, 4),
            vec![(Some(1), 0), (Some(1), 1)]
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Contention("database is locked".into()).is_transient());
        let busy = redis::RedisError::from((redis::ErrorKind::BusyLoadingError, "loading"));
        assert!(StoreError::Redis(busy).is_transient());
        let type_err = redis::RedisError::from((redis::ErrorKind::TypeError, "bad"));
        assert!(!StoreError::Redis(type_err).is_transient());
    }

    #[tokio::test]
    async fn test_join_yields_missing_problem_as_none() {
        let store = MemoryStore::new();
        store.insert_problem(Problem {
            id: "p1".into(),
            source: None,
            difficulty: None,
            test_cases: json!({"inputs": ["1"], "outputs": ["1"]}),
        });
        store.insert_candidate(candidate("c1", "p1", None));
        store.insert_candidate(candidate("c2", "missing", Some(VerificationStatus::Pending)));
        store.insert_candidate(candidate("c3", "p1", Some(VerificationStatus::Passed)));

        let mut rx = stream_candidates_with_problems(
            Arc::new(store),
            StatusFilter::default(),
            None,
            0,
            1,
        );

        let mut seen = Vec::new();
        while let Some(task) = rx.recv().await {
            let task = task.unwrap();
            seen.push((task.candidate.id.clone(), task.problem.is_some()));
        }
        assert_eq!(seen, vec![("c1".to_string(), true), ("c2".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_join_with_multiple_readers_covers_every_row() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store.insert_candidate(candidate(&format!("c{i}"), "p", None));
        }

        let mut rx = stream_candidates_with_problems(
            Arc::new(store),
            StatusFilter::default(),
            Some(20),
            3,
            4,
        );

        let mut ids = Vec::new();
        while let Some(task) = rx.recv().await {
            ids.push(task.unwrap().candidate.id);
        }
        ids.sort_by_key(|id| id[1..].parse::<usize>().unwrap());
        let expected: Vec<String> = (3..23).map(|i| format!("c{i}")).collect();
        assert_eq!(ids, expected);
    }
}
