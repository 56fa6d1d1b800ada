// Test doubles shared by the worker's unit tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use verifier_common::types::{RunRequest, RunResponse, RunStatus};
use verifier_runner::{CodeRunner, LocalRunner, RunnerError};

type Respond = dyn Fn(&RunRequest) -> Result<RunResponse, RunnerError> + Send + Sync;

/// Scripted runner that answers every request with a closure.
pub struct FakeRunner {
    respond: Box<Respond>,
    calls: AtomicUsize,
}

impl FakeRunner {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&RunRequest) -> Result<RunResponse, RunnerError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        }
    }

    /// Prints the driver's pass sentinel for every request.
    pub fn passing() -> Self {
        Self::new(|_| Ok(success("PASSED\n")))
    }

    /// Passes programs containing `needle`, fails the rest.
    pub fn passing_if_contains(needle: &'static str) -> Self {
        Self::new(move |request| {
            if request.code.contains(needle) {
                Ok(success("PASSED\n"))
            } else {
                Ok(success("FAILED\n"))
            }
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeRunner for FakeRunner {
    async fn execute(&self, request: &RunRequest) -> Result<RunResponse, RunnerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(request)
    }
}

pub fn success(stdout: &str) -> RunResponse {
    RunResponse {
        status: RunStatus::Success,
        stdout: stdout.to_string(),
        stderr: String::new(),
        return_code: Some(0),
    }
}

/// Local runner on the host interpreter, or `None` when python3 is missing.
pub fn python_runner() -> Option<Arc<dyn CodeRunner>> {
    let runner = LocalRunner::new("python3");
    if runner.is_available() {
        Some(Arc::new(runner))
    } else {
        eprintln!("python3 not found on PATH, skipping");
        None
    }
}
