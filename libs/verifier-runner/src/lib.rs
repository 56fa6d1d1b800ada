//! Code runners - execute one program with one stdin under time/memory bounds.
//!
//! A runner knows HOW to execute. It does not know test cases or scoring;
//! it returns raw output for the evaluator to judge.
//!
//! Failure classes:
//! - candidate failure: captured in `stderr`/`return_code` with status `success`
//! - timeout: status `timeout`, output discarded
//! - infrastructure failure: status `infra_error`, or `Err` when the caller
//!   has to treat the request differently (oversized payloads)

use async_trait::async_trait;
use thiserror::Error;
use verifier_common::types::{RunRequest, RunResponse};

pub mod bootstrap;
pub mod docker;
pub mod guard;
pub mod local;
pub mod remote;
pub mod seccomp;

pub use docker::DockerRunner;
pub use local::LocalRunner;
pub use remote::RemoteRunner;

/// Safety limits to keep pathological payloads away from the sandbox
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_STDIN_BYTES: usize = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("request too large: {0}")]
    RequestTooLarge(String),
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn execute(&self, request: &RunRequest) -> Result<RunResponse, RunnerError>;
}

/// Reject requests over the payload limits before any work is done.
pub fn check_request_size(request: &RunRequest) -> Result<(), RunnerError> {
    if request.code.len() > MAX_SOURCE_CODE_BYTES {
        return Err(RunnerError::RequestTooLarge(format!(
            "Source code exceeds maximum size of {} bytes",
            MAX_SOURCE_CODE_BYTES
        )));
    }
    if request.stdin.len() > MAX_STDIN_BYTES {
        return Err(RunnerError::RequestTooLarge(format!(
            "Stdin exceeds maximum size of {} bytes",
            MAX_STDIN_BYTES
        )));
    }
    Ok(())
}

/// Only Python programs are supported by the bundled runners.
pub fn check_language(language: &str) -> Result<(), RunnerError> {
    match language.to_ascii_lowercase().as_str() {
        "python" | "python3" | "py" => Ok(()),
        other => Err(RunnerError::UnsupportedLanguage(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verifier_common::config::ExecutionLimits;

    #[test]
    fn test_size_limits() {
        let limits = ExecutionLimits::default();
        let ok = RunRequest::new("print(1)", "", "python", &limits);
        assert!(check_request_size(&ok).is_ok());

        let big_code = RunRequest::new("x".repeat(MAX_SOURCE_CODE_BYTES + 1), "", "python", &limits);
        assert!(matches!(
            check_request_size(&big_code),
            Err(RunnerError::RequestTooLarge(_))
        ));

        let big_stdin = RunRequest::new("print(1)", "x".repeat(MAX_STDIN_BYTES + 1), "python", &limits);
        assert!(matches!(
            check_request_size(&big_stdin),
            Err(RunnerError::RequestTooLarge(_))
        ));
    }

    #[test]
    fn test_language_check() {
        assert!(check_language("Python").is_ok());
        assert!(check_language("python3").is_ok());
        assert!(matches!(
            check_language("java"),
            Err(RunnerError::UnsupportedLanguage(l)) if l == "java"
        ));
    }
}
