use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::store::{Store, StoreError, StoreResult};
use crate::types::{Candidate, CandidateUpdate, Problem, StatusFilter, VerificationStatus};

/// Redis layout - keys are deterministic so every tool agrees on them.
///
/// - `verifier:problem:{id}`: problem as a JSON string
/// - `verifier:candidate:{id}`: hash of candidate fields
/// - `verifier:candidates`: sorted set of candidate ids in insertion order
pub const PROBLEM_PREFIX: &str = "verifier:problem";
pub const CANDIDATE_PREFIX: &str = "verifier:candidate";
pub const CANDIDATE_INDEX: &str = "verifier:candidates";
pub const CANDIDATE_SEQ: &str = "verifier:candidates:seq";

const FIELD_PROBLEM_ID: &str = "problem_id";
const FIELD_CODE: &str = "extracted_code";
const FIELD_STATUS: &str = "verification_status";
const FIELD_DETAILS: &str = "verification_details";

/// Ids fetched per index page
const PAGE_SIZE: isize = 500;

pub fn problem_key(id: &str) -> String {
    format!("{}:{}", PROBLEM_PREFIX, id)
}

pub fn candidate_key(id: &str) -> String {
    format!("{}:{}", CANDIDATE_PREFIX, id)
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis");
        Ok(Self { conn })
    }

    pub async fn insert_problem(&self, problem: &Problem) -> StoreResult<()> {
        let payload = serde_json::to_string(problem)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(problem_key(&problem.id), payload).await?;
        Ok(())
    }

    /// Insert a candidate, appending it to the index if it is new.
    pub async fn insert_candidate(&self, candidate: &Candidate) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let seq: i64 = conn.incr(CANDIDATE_SEQ, 1).await?;

        let mut fields = vec![(FIELD_PROBLEM_ID, candidate.problem_id.clone())];
        if let Some(code) = &candidate.extracted_code {
            fields.push((FIELD_CODE, code.clone()));
        }
        if let Some(status) = candidate.verification_status {
            fields.push((FIELD_STATUS, status.as_str().to_string()));
        }
        if let Some(details) = &candidate.verification_details {
            fields.push((FIELD_DETAILS, serde_json::to_string(details)?));
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(candidate_key(&candidate.id), &fields[..]).ignore();
        pipe.cmd("ZADD")
            .arg(CANDIDATE_INDEX)
            .arg("NX")
            .arg(seq)
            .arg(&candidate.id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

fn update_fields(update: &CandidateUpdate) -> StoreResult<Vec<(&'static str, String)>> {
    Ok(vec![
        (FIELD_STATUS, update.verification_status.as_str().to_string()),
        (FIELD_DETAILS, serde_json::to_string(&update.verification_details)?),
    ])
}

/// Rebuild a candidate from its hash. Deleted or corrupt rows yield `None`.
fn candidate_from_hash(id: &str, mut fields: HashMap<String, String>) -> Option<Candidate> {
    let problem_id = fields.remove(FIELD_PROBLEM_ID)?;

    let verification_status = match fields.remove(FIELD_STATUS).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<VerificationStatus>() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(candidate_id = %id, error = %e, "Skipping candidate with unknown status");
                return None;
            }
        },
    };

    let verification_details = fields
        .remove(FIELD_DETAILS)
        .and_then(|raw| serde_json::from_str(&raw).ok());

    Some(Candidate {
        id: id.to_string(),
        problem_id,
        extracted_code: fields.remove(FIELD_CODE),
        verification_status,
        verification_details,
    })
}

#[async_trait]
impl Store for RedisStore {
    async fn get_problem(&self, id: &str) -> StoreResult<Option<Problem>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(problem_key(id)).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    fn stream_candidates<'a>(
        &'a self,
        statuses: &'a StatusFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> BoxStream<'a, StoreResult<Candidate>> {
        let mut conn = self.conn.clone();

        Box::pin(try_stream! {
            let mut skipped = 0usize;
            let mut yielded = 0usize;
            let mut start: isize = 0;

            'pages: loop {
                if limit.is_some_and(|l| yielded >= l) {
                    break;
                }

                let ids: Vec<String> = conn
                    .zrange(CANDIDATE_INDEX, start, start + PAGE_SIZE - 1)
                    .await
                    .map_err(StoreError::from)?;
                if ids.is_empty() {
                    break;
                }
                start += PAGE_SIZE;

                let mut pipe = redis::pipe();
                for id in &ids {
                    pipe.hgetall(candidate_key(id));
                }
                let rows: Vec<HashMap<String, String>> = pipe
                    .query_async(&mut conn)
                    .await
                    .map_err(StoreError::from)?;

                for (id, fields) in ids.iter().zip(rows) {
                    let Some(candidate) = candidate_from_hash(id, fields) else {
                        continue;
                    };
                    if !statuses.matches(candidate.verification_status) {
                        continue;
                    }
                    if skipped < offset {
                        skipped += 1;
                        continue;
                    }
                    if limit.is_some_and(|l| yielded >= l) {
                        break 'pages;
                    }
                    yielded += 1;
                    yield candidate;
                }
            }
        })
    }

    async fn update(&self, update: &CandidateUpdate) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let fields = update_fields(update)?;
        let _: () = conn
            .hset_multiple(candidate_key(&update.id), &fields[..])
            .await?;
        Ok(())
    }

    async fn update_batch(&self, updates: &[CandidateUpdate]) -> StoreResult<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for update in updates {
            let fields = update_fields(update)?;
            pipe.hset_multiple(candidate_key(&update.id), &fields[..]).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
