use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::config::ExecutionLimits;

/// Verification lifecycle of a candidate.
///
/// Rows that were never touched carry no status at all; that "null" state is
/// modelled as `Option<VerificationStatus>::None` everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Passed,
    Failed,
    Error,
    Skipped,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Passed => "passed",
            VerificationStatus::Failed => "failed",
            VerificationStatus::Error => "error",
            VerificationStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown verification status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for VerificationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(VerificationStatus::Pending),
            "passed" => Ok(VerificationStatus::Passed),
            "failed" => Ok(VerificationStatus::Failed),
            "error" => Ok(VerificationStatus::Error),
            "skipped" => Ok(VerificationStatus::Skipped),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Statuses a verification run is allowed to pick up.
///
/// This filter is the only thing keeping two runs off the same candidate:
/// there is no lease, so concurrent runs over the same store can race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFilter {
    statuses: Vec<Option<VerificationStatus>>,
}

impl StatusFilter {
    pub fn new(statuses: Vec<Option<VerificationStatus>>) -> Self {
        Self { statuses }
    }

    /// pending, error and never-verified rows
    pub fn default_retry() -> Self {
        Self::new(vec![
            Some(VerificationStatus::Pending),
            Some(VerificationStatus::Error),
            None,
        ])
    }

    /// Everything that has not passed yet.
    pub fn all_unpassed() -> Self {
        Self::new(vec![
            Some(VerificationStatus::Pending),
            Some(VerificationStatus::Failed),
            Some(VerificationStatus::Error),
            Some(VerificationStatus::Skipped),
            None,
        ])
    }

    /// Parse a `--retry-status` value: `all`, or a comma separated list where
    /// `null`/`none` select rows without a status.
    pub fn parse(spec: &str) -> Result<Self, UnknownStatus> {
        if spec.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::all_unpassed());
        }

        let mut statuses = Vec::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let status = if part.eq_ignore_ascii_case("null") || part.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(part.parse::<VerificationStatus>()?)
            };
            if !statuses.contains(&status) {
                statuses.push(status);
            }
        }

        if statuses.is_empty() {
            return Err(UnknownStatus(spec.to_string()));
        }
        Ok(Self::new(statuses))
    }

    pub fn matches(&self, status: Option<VerificationStatus>) -> bool {
        self.statuses.contains(&status)
    }

    pub fn statuses(&self) -> &[Option<VerificationStatus>] {
        &self.statuses
    }
}

impl Default for StatusFilter {
    fn default() -> Self {
        Self::default_retry()
    }
}

impl fmt::Display for StatusFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .statuses
            .iter()
            .map(|s| s.as_ref().map(VerificationStatus::as_str).unwrap_or("null"))
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// A coding task. `test_cases` is kept exactly as stored upstream; use
/// [`Problem::test_suite`] to get the parsed cases and calling convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub test_cases: Value,
}

/// A generated solution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub problem_id: String,
    #[serde(default)]
    pub extracted_code: Option<String>,
    #[serde(default)]
    pub verification_status: Option<VerificationStatus>,
    #[serde(default)]
    pub verification_details: Option<Value>,
}

impl Candidate {
    /// Extracted source, if there is any non-blank text to run.
    pub fn source(&self) -> Option<&str> {
        self.extracted_code
            .as_deref()
            .filter(|code| !code.trim().is_empty())
    }
}

/// A candidate paired with its problem for one verification pass. Never
/// persisted; `problem` is `None` when the referenced problem is missing.
#[derive(Debug, Clone)]
pub struct VerificationTask {
    pub candidate: Candidate,
    pub problem: Option<Problem>,
}

/// Outcome of a single test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerTestResult {
    pub index: usize,
    pub passed: bool,
    #[serde(default)]
    pub expected: String,
    #[serde(default)]
    pub actual: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub return_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FailureDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured `verification_details` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum VerificationDetails {
    Tests(Vec<PerTestResult>),
    Failure(FailureDetails),
    Other(Value),
}

// Untagged derive buffers numbers as opaque maps under `arbitrary_precision`,
// so the shape is picked from a `Value` instead.
impl<'de> Deserialize<'de> for VerificationDetails {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(VerificationDetails::from_value)
    }
}

impl VerificationDetails {
    /// Test list first, then a reason/error object, anything else verbatim.
    pub fn from_value(value: Value) -> Self {
        if value.is_array() {
            if let Ok(results) = serde_json::from_value::<Vec<PerTestResult>>(value.clone()) {
                return VerificationDetails::Tests(results);
            }
        }
        if value.is_object() {
            if let Ok(failure) = serde_json::from_value::<FailureDetails>(value.clone()) {
                return VerificationDetails::Failure(failure);
            }
        }
        VerificationDetails::Other(value)
    }

    /// First error message worth surfacing in a failure log.
    pub fn first_error(&self) -> Option<String> {
        match self {
            VerificationDetails::Tests(results) => results
                .iter()
                .find(|r| !r.passed)
                .map(|r| r.error.clone()),
            VerificationDetails::Failure(f) => f.error.clone().or_else(|| f.reason.clone()),
            VerificationDetails::Other(v) => Some(v.to_string()),
        }
    }
}

/// Aggregate outcome for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: VerificationStatus,
    pub details: VerificationDetails,
}

impl Verdict {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::Error,
            details: VerificationDetails::Failure(FailureDetails {
                reason: None,
                error: Some(message.into()),
            }),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::Skipped,
            details: VerificationDetails::Failure(FailureDetails {
                reason: Some(reason.into()),
                error: None,
            }),
        }
    }

    pub fn skipped_with_error(reason: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::Skipped,
            details: VerificationDetails::Failure(FailureDetails {
                reason: Some(reason.into()),
                error: Some(error.into()),
            }),
        }
    }

    /// `passed` only when every test passed.
    pub fn from_tests(results: Vec<PerTestResult>) -> Self {
        let status = if results.iter().all(|r| r.passed) {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Failed
        };
        Self {
            status,
            details: VerificationDetails::Tests(results),
        }
    }
}

/// Fields written back for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateUpdate {
    pub id: String,
    pub verification_status: VerificationStatus,
    pub verification_details: VerificationDetails,
}

impl CandidateUpdate {
    pub fn from_verdict(id: impl Into<String>, verdict: Verdict) -> Self {
        Self {
            id: id.into(),
            verification_status: verdict.status,
            verification_details: verdict.details,
        }
    }
}

/// One line of an offline task file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub problem_id: String,
    #[serde(default)]
    pub code: Option<String>,
    pub language: String,
    #[serde(default)]
    pub test_cases: Value,
    #[serde(default)]
    pub import_string: String,
}

/// One line of an offline result file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    pub verification_status: VerificationStatus,
    pub verification_details: VerificationDetails,
}

impl From<ResultRecord> for CandidateUpdate {
    fn from(record: ResultRecord) -> Self {
        Self {
            id: record.id,
            verification_status: record.verification_status,
            verification_details: record.verification_details,
        }
    }
}

/// Runner-level status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Timeout,
    InfraError,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Success => "success",
            RunStatus::Timeout => "timeout",
            RunStatus::InfraError => "infra_error",
        };
        f.write_str(name)
    }
}

/// Execution request, also the body of the remote protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub code: String,
    #[serde(default)]
    pub stdin: String,
    pub language: String,
    pub compile_timeout: f64,
    pub run_timeout: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
}

impl RunRequest {
    pub fn new(
        code: impl Into<String>,
        stdin: impl Into<String>,
        language: impl Into<String>,
        limits: &ExecutionLimits,
    ) -> Self {
        Self {
            code: code.into(),
            stdin: stdin.into(),
            language: language.into(),
            compile_timeout: limits.compile_timeout.as_secs_f64(),
            run_timeout: limits.run_timeout.as_secs_f64(),
            memory_limit_mb: Some(limits.memory_limit_mb),
        }
    }
}

/// Execution response, also the body of the remote protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub status: RunStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub return_code: Option<i32>,
}

impl RunResponse {
    pub fn infra_error(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::InfraError,
            stdout: String::new(),
            stderr: message.into(),
            return_code: None,
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: RunStatus::Timeout,
            stdout: String::new(),
            stderr: "Execution timed out".to_string(),
            return_code: None,
        }
    }

    /// The program ran to completion and exited cleanly.
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success && self.return_code == Some(0)
    }
}
