use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::store::{Store, StoreError, StoreResult};
use crate::types::{Candidate, CandidateUpdate, Problem, StatusFilter};

/// In-process store used for dry runs, offline tooling and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    problems: HashMap<String, Problem>,
    candidates: Vec<Candidate>,
    positions: HashMap<String, usize>,
    /// Number of upcoming writes that fail with a contention error.
    contended_writes: usize,
    batch_writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking test thread must not poison every later assertion
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_problem(&self, problem: Problem) {
        self.lock().problems.insert(problem.id.clone(), problem);
    }

    /// Insert or replace a candidate. New ids are appended in storage order.
    pub fn insert_candidate(&self, candidate: Candidate) {
        let mut inner = self.lock();
        match inner.positions.get(&candidate.id).copied() {
            Some(pos) => inner.candidates[pos] = candidate,
            None => {
                let pos = inner.candidates.len();
                inner.positions.insert(candidate.id.clone(), pos);
                inner.candidates.push(candidate);
            }
        }
    }

    pub fn candidate(&self, id: &str) -> Option<Candidate> {
        let inner = self.lock();
        inner
            .positions
            .get(id)
            .map(|pos| inner.candidates[*pos].clone())
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.lock().candidates.clone()
    }

    /// Make the next `count` writes fail as if the store were locked.
    pub fn contend_next_writes(&self, count: usize) {
        self.lock().contended_writes = count;
    }

    /// Number of successful `update_batch` calls so far.
    pub fn batch_writes(&self) -> usize {
        self.lock().batch_writes
    }
}

impl Inner {
    fn check_contention(&mut self) -> StoreResult<()> {
        if self.contended_writes > 0 {
            self.contended_writes -= 1;
            return Err(StoreError::Contention("database is locked".to_string()));
        }
        Ok(())
    }

    fn apply(&mut self, update: &CandidateUpdate) -> StoreResult<()> {
        let Some(pos) = self.positions.get(&update.id).copied() else {
            // updating an unknown id is a no-op
            return Ok(());
        };
        let details = serde_json::to_value(&update.verification_details)?;
        let candidate = &mut self.candidates[pos];
        candidate.verification_status = Some(update.verification_status);
        candidate.verification_details = Some(details);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_problem(&self, id: &str) -> StoreResult<Option<Problem>> {
        Ok(self.lock().problems.get(id).cloned())
    }

    fn stream_candidates<'a>(
        &'a self,
        statuses: &'a StatusFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> BoxStream<'a, StoreResult<Candidate>> {
        let rows: Vec<Candidate> = self
            .lock()
            .candidates
            .iter()
            .filter(|c| statuses.matches(c.verification_status))
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Box::pin(stream::iter(rows.into_iter().map(Ok)))
    }

    async fn update(&self, update: &CandidateUpdate) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.check_contention()?;
        inner.apply(update)
    }

    async fn update_batch(&self, updates: &[CandidateUpdate]) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.check_contention()?;

        // serialize everything first so a bad payload leaves the batch unapplied
        let mut staged = Vec::with_capacity(updates.len());
        for update in updates {
            staged.push((update, serde_json::to_value(&update.verification_details)?));
        }
        for (update, details) in staged {
            if let Some(pos) = inner.positions.get(&update.id).copied() {
                let candidate = &mut inner.candidates[pos];
                candidate.verification_status = Some(update.verification_status);
                candidate.verification_details = Some(details);
            }
        }
        inner.batch_writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Verdict, VerificationStatus};
    use futures_util::StreamExt;

    fn candidate(id: &str, status: Option<VerificationStatus>) -> Candidate {
        Candidate {
            id: id.to_string(),
            problem_id: "p".to_string(),
            extracted_code: None,
            verification_status: status,
            verification_details: None,
        }
    }

    #[tokio::test]
    async fn test_stream_applies_filter_offset_and_limit() {
        let store = MemoryStore::new();
        store.insert_candidate(candidate("a", None));
        store.insert_candidate(candidate("b", Some(VerificationStatus::Passed)));
        store.insert_candidate(candidate("c", Some(VerificationStatus::Pending)));
        store.insert_candidate(candidate("d", Some(VerificationStatus::Error)));

        let filter = StatusFilter::default();
        let ids: Vec<String> = store
            .stream_candidates(&filter, Some(1), 1)
            .map(|c| c.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_contended_batch_is_not_applied() {
        let store = MemoryStore::new();
        store.insert_candidate(candidate("a", None));
        store.contend_next_writes(1);

        let update = CandidateUpdate::from_verdict("a", Verdict::skipped("No extracted code"));
        let err = store.update_batch(&[update.clone()]).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.candidate("a").unwrap().verification_status, None);

        store.update_batch(&[update]).await.unwrap();
        assert_eq!(
            store.candidate("a").unwrap().verification_status,
            Some(VerificationStatus::Skipped)
        );
        assert_eq!(store.batch_writes(), 1);
    }
}
