/// Candidate Executor - Per-Record Verification
///
/// **Responsibility:**
/// Turn one candidate plus its problem into a Verdict.
///
/// **Architecture:**
/// 1. Build a harness per test case (harness.rs)
/// 2. Run it through the configured CodeRunner (verifier-runner)
/// 3. Judge the output (evaluator.rs)
/// 4. Aggregate: passed only if every test passed
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (the runner's job)
/// - How outputs are compared (the evaluator's job)
/// - Where verdicts are stored (the orchestrator's job)
///
/// Every failure is turned into a Verdict here; nothing escapes the record.
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use verifier_common::config::{ExecutionLimits, DEFAULT_LANGUAGE};
use verifier_common::suite::TestSuite;
use verifier_common::types::{
    PerTestResult, ResultRecord, RunRequest, RunStatus, TaskRecord, Verdict, VerificationTask,
};
use verifier_runner::{CodeRunner, RunnerError};

use crate::evaluator::{evaluate_test, preview};
use crate::harness::{call_target, HarnessBuilder};

pub const PROBLEM_NOT_FOUND: &str = "Problem not found";
pub const NO_CODE: &str = "No extracted code";
pub const REQUEST_TOO_LARGE: &str = "request_too_large";

/// Pipeline error text kept on a record.
const PIPELINE_ERROR_CHARS: usize = 500;

pub struct Executor {
    runner: Arc<dyn CodeRunner>,
    harness: HarnessBuilder,
    limits: ExecutionLimits,
    language: String,
}

impl Executor {
    pub fn new(runner: Arc<dyn CodeRunner>, limits: ExecutionLimits) -> Self {
        Self {
            runner,
            harness: HarnessBuilder::new(),
            limits,
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Online path: candidate joined with its problem.
    pub async fn verify(&self, task: &VerificationTask) -> Verdict {
        let Some(problem) = &task.problem else {
            warn!(
                candidate_id = %task.candidate.id,
                problem_id = %task.candidate.problem_id,
                "Problem not found"
            );
            return Verdict::error(PROBLEM_NOT_FOUND);
        };

        self.verify_source(
            &self.harness,
            &self.language,
            task.candidate.source(),
            &problem.test_cases,
        )
        .await
    }

    /// Offline path: one task-file line. The task's own prelude and language
    /// are used; a null `test_cases` means the problem was missing at dump time.
    pub async fn verify_task_record(&self, record: &TaskRecord) -> ResultRecord {
        let verdict = if record.test_cases.is_null() {
            Verdict::error(PROBLEM_NOT_FOUND)
        } else {
            let harness = HarnessBuilder::with_prelude(record.import_string.as_str());
            let source = record.code.as_deref().filter(|c| !c.trim().is_empty());
            self.verify_source(&harness, &record.language, source, &record.test_cases)
                .await
        };

        ResultRecord {
            id: record.id.clone(),
            verification_status: verdict.status,
            verification_details: verdict.details,
        }
    }

    async fn verify_source(
        &self,
        harness: &HarnessBuilder,
        language: &str,
        source: Option<&str>,
        test_cases: &Value,
    ) -> Verdict {
        let Some(source) = source else {
            return Verdict::skipped(NO_CODE);
        };

        let suite = match TestSuite::parse(test_cases) {
            Ok(suite) => suite,
            Err(e) => return Verdict::error(e.to_string()),
        };

        match self.run_suite(harness, language, source, &suite).await {
            Ok(results) => Verdict::from_tests(results),
            Err(verdict) => verdict,
        }
    }

    /// Runs every test case, even after a failure. Pipeline failures cut the
    /// run short and come back as the record's verdict.
    async fn run_suite(
        &self,
        harness: &HarnessBuilder,
        language: &str,
        source: &str,
        suite: &TestSuite,
    ) -> Result<Vec<PerTestResult>, Verdict> {
        let target = suite
            .function_name()
            .map(|name| call_target(source, name))
            .unwrap_or_default();

        let mut results = Vec::with_capacity(suite.len());
        for (index, case) in suite.cases.iter().enumerate() {
            let built = harness.build(source, &suite.convention, &target, case);
            let request = RunRequest::new(built.program, built.stdin, language, &self.limits);

            let response = self
                .runner
                .execute(&request)
                .await
                .map_err(runner_failure)?;

            if response.status == RunStatus::InfraError {
                return Err(Verdict::error(truncate(&format!(
                    "Sandbox infrastructure failure: {}",
                    response.stderr
                ))));
            }

            let result = evaluate_test(index, &response, &suite.convention, case);
            debug!(
                test_index = index,
                passed = result.passed,
                status = %response.status,
                return_code = ?response.return_code,
                "Test evaluated"
            );
            results.push(result);
        }

        Ok(results)
    }
}

fn runner_failure(error: RunnerError) -> Verdict {
    match error {
        RunnerError::RequestTooLarge(_) => {
            Verdict::skipped_with_error(REQUEST_TOO_LARGE, truncate(&error.to_string()))
        }
        other => Verdict::error(truncate(&other.to_string())),
    }
}

fn truncate(text: &str) -> String {
    preview(text, PIPELINE_ERROR_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{python_runner, FakeRunner};
    use serde_json::json;
    use verifier_common::types::{
        Candidate, FailureDetails, Problem, RunResponse, VerificationDetails, VerificationStatus,
    };

    fn make_task(code: Option<&str>, test_cases: Option<Value>) -> VerificationTask {
        VerificationTask {
            candidate: Candidate {
                id: "c1".to_string(),
                problem_id: "p1".to_string(),
                extracted_code: code.map(str::to_string),
                verification_status: Some(VerificationStatus::Pending),
                verification_details: None,
            },
            problem: test_cases.map(|test_cases| Problem {
                id: "p1".to_string(),
                source: Some("apps".to_string()),
                difficulty: None,
                test_cases,
            }),
        }
    }

    fn add_suite() -> Value {
        json!({"fn_name": "add", "inputs": [[2, 3]], "outputs": [5]})
    }

    fn executor(runner: Arc<dyn CodeRunner>) -> Executor {
        Executor::new(runner, ExecutionLimits::new(5.0, 5.0, 512))
    }

    fn tests_of(verdict: &Verdict) -> &[PerTestResult] {
        match &verdict.details {
            VerificationDetails::Tests(results) => results,
            other => panic!("expected per-test results, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_problem_is_error() {
        let runner = Arc::new(FakeRunner::passing());
        let verdict = executor(runner.clone()).verify(&make_task(Some("x = 1"), None)).await;
        assert_eq!(verdict, Verdict::error("Problem not found"));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_is_skipped_without_running() {
        let runner = Arc::new(FakeRunner::passing());
        let exec = executor(runner.clone());
        for code in [None, Some(""), Some("  \n")] {
            for suite in [add_suite(), json!("garbage"), json!({})] {
                let verdict = exec.verify(&make_task(code, Some(suite))).await;
                assert_eq!(verdict, Verdict::skipped("No extracted code"));
            }
        }
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_bad_test_data_is_error() {
        let exec = executor(Arc::new(FakeRunner::passing()));

        let verdict = exec.verify(&make_task(Some("x = 1"), Some(json!("{not json")))).await;
        assert_eq!(verdict, Verdict::error("Failed to parse test_cases JSON"));

        let verdict = exec
            .verify(&make_task(Some("x = 1"), Some(json!({"inputs": [], "outputs": []}))))
            .await;
        assert_eq!(verdict, Verdict::error("No test cases found or unrecognized format"));
    }

    #[tokio::test]
    async fn test_runs_every_case_after_failure() {
        let runner = Arc::new(FakeRunner::new(|request: &RunRequest| {
            let stdout = if request.stdin.starts_with('1') { "wrong" } else { "ok" };
            Ok(RunResponse {
                status: RunStatus::Success,
                stdout: stdout.to_string(),
                stderr: String::new(),
                return_code: Some(0),
            })
        }));
        let suite = json!({"inputs": ["1", "2", "3"], "outputs": ["ok", "ok", "ok"]});
        let verdict = executor(runner.clone())
            .verify(&make_task(Some("print('ok')"), Some(suite)))
            .await;

        assert_eq!(verdict.status, VerificationStatus::Failed);
        let results = tests_of(&verdict);
        assert_eq!(results.len(), 3);
        assert_eq!(
            results.iter().map(|r| r.passed).collect::<Vec<_>>(),
            vec![false, true, true]
        );
        assert_eq!(runner.calls(), 3);
    }

    #[tokio::test]
    async fn test_oversized_request_is_skipped() {
        let runner = Arc::new(FakeRunner::new(|_: &RunRequest| {
            Err(RunnerError::RequestTooLarge("413 Request Entity Too Large".to_string()))
        }));
        let verdict = executor(runner).verify(&make_task(Some("x = 1"), Some(add_suite()))).await;
        assert_eq!(verdict.status, VerificationStatus::Skipped);
        assert_eq!(
            verdict.details,
            VerificationDetails::Failure(FailureDetails {
                reason: Some("request_too_large".to_string()),
                error: Some("request too large: 413 Request Entity Too Large".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_infra_failure_is_error() {
        let runner = Arc::new(FakeRunner::new(|_: &RunRequest| {
            Ok(RunResponse::infra_error("Sandbox unavailable after 3 attempts: refused"))
        }));
        let verdict = executor(runner).verify(&make_task(Some("x = 1"), Some(add_suite()))).await;
        assert_eq!(verdict.status, VerificationStatus::Error);
        assert_eq!(
            verdict.details.first_error().as_deref(),
            Some("Sandbox infrastructure failure: Sandbox unavailable after 3 attempts: refused")
        );
    }

    #[tokio::test]
    async fn test_pipeline_error_text_is_truncated() {
        let runner = Arc::new(FakeRunner::new(|_: &RunRequest| {
            Err(RunnerError::Io(std::io::Error::other("x".repeat(2000))))
        }));
        let verdict = executor(runner).verify(&make_task(Some("x = 1"), Some(add_suite()))).await;
        assert_eq!(verdict.status, VerificationStatus::Error);
        assert_eq!(verdict.details.first_error().map(|e| e.chars().count()), Some(500));
    }

    #[tokio::test]
    async fn test_task_record_uses_its_prelude_and_language() {
        let runner = Arc::new(FakeRunner::new(|request: &RunRequest| {
            assert!(request.code.starts_with("import math\n"));
            assert_eq!(request.language, "python3");
            Ok(RunResponse {
                status: RunStatus::Success,
                stdout: "PASSED\n".to_string(),
                stderr: String::new(),
                return_code: Some(0),
            })
        }));
        let record = TaskRecord {
            id: "c9".to_string(),
            problem_id: "p9".to_string(),
            code: Some("def add(a, b):\n    return a + b".to_string()),
            language: "python3".to_string(),
            test_cases: add_suite(),
            import_string: "import math".to_string(),
        };
        let result = executor(runner).verify_task_record(&record).await;
        assert_eq!(result.id, "c9");
        assert_eq!(result.verification_status, VerificationStatus::Passed);
    }

    #[tokio::test]
    async fn test_task_record_without_test_cases() {
        let record = TaskRecord {
            id: "c9".to_string(),
            problem_id: "gone".to_string(),
            code: Some("x = 1".to_string()),
            language: "python".to_string(),
            test_cases: Value::Null,
            import_string: String::new(),
        };
        let result = executor(Arc::new(FakeRunner::passing()))
            .verify_task_record(&record)
            .await;
        assert_eq!(result.verification_status, VerificationStatus::Error);
    }

    #[tokio::test]
    async fn test_stdio_doubling_passes() {
        let Some(runner) = python_runner() else { return };
        let suite = json!({"inputs": ["3\n"], "outputs": ["6\n"]});
        let verdict = executor(runner)
            .verify(&make_task(Some("n = int(input())\nprint(n * 2)"), Some(suite)))
            .await;
        assert_eq!(verdict.status, VerificationStatus::Passed, "{:?}", verdict.details);
    }

    #[tokio::test]
    async fn test_function_add_passes() {
        let Some(runner) = python_runner() else { return };
        let verdict = executor(runner)
            .verify(&make_task(Some("def add(a, b):\n    return a + b"), Some(add_suite())))
            .await;
        assert_eq!(verdict.status, VerificationStatus::Passed, "{:?}", verdict.details);
    }

    #[tokio::test]
    async fn test_solution_method_passes() {
        let Some(runner) = python_runner() else { return };
        let code = "class Solution:\n    def add(self, a, b):\n        return a + b";
        let verdict = executor(runner).verify(&make_task(Some(code), Some(add_suite()))).await;
        assert_eq!(verdict.status, VerificationStatus::Passed, "{:?}", verdict.details);
    }

    #[tokio::test]
    async fn test_single_element_expected_list_passes() {
        let Some(runner) = python_runner() else { return };
        let suite = json!({"fn_name": "five", "inputs": [[]], "outputs": [[5]]});
        let verdict = executor(runner)
            .verify(&make_task(Some("def five():\n    return 5"), Some(suite)))
            .await;
        assert_eq!(verdict.status, VerificationStatus::Passed, "{:?}", verdict.details);
    }

    #[tokio::test]
    async fn test_raising_function_fails_with_detail() {
        let Some(runner) = python_runner() else { return };
        let code = "def add(a, b):\n    raise ValueError('boom')";
        let verdict = executor(runner).verify(&make_task(Some(code), Some(add_suite()))).await;

        assert_eq!(verdict.status, VerificationStatus::Failed);
        let results = tests_of(&verdict);
        assert!(!results[0].passed);
        assert_eq!(results[0].actual, "RUNTIME ERROR");
        assert!(results[0].stderr.contains("RUNTIME ERROR: boom"));
    }

    #[tokio::test]
    async fn test_big_integer_expectations_keep_their_digits() {
        const BIG: &str = "123456789012345678901234567890";
        let suite: Value = serde_json::from_str(&format!(
            r#"{{"fn_name": "big", "inputs": [[]], "outputs": [{}]}}"#,
            BIG
        ))
        .unwrap();
        let code = format!("def big():\n    return {}", BIG);

        let runner = Arc::new(FakeRunner::passing_if_contains("_harness_expected = 123456789012345678901234567890\n"));
        let verdict = executor(runner.clone())
            .verify(&make_task(Some(&code), Some(suite.clone())))
            .await;
        assert_eq!(verdict.status, VerificationStatus::Passed, "{:?}", verdict.details);

        let Some(runner) = python_runner() else { return };
        let verdict = executor(runner.clone())
            .verify(&make_task(Some(&code), Some(suite)))
            .await;
        assert_eq!(verdict.status, VerificationStatus::Passed, "{:?}", verdict.details);

        let stdio: Value =
            serde_json::from_str(&format!(r#"{{"inputs": [""], "outputs": [{}]}}"#, BIG)).unwrap();
        let verdict = executor(runner)
            .verify(&make_task(Some(&format!("print({})", BIG)), Some(stdio)))
            .await;
        assert_eq!(verdict.status, VerificationStatus::Passed, "{:?}", verdict.details);
    }
}
