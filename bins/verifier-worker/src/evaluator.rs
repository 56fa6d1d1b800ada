/// Test Evaluator - Output Comparison and Per-Test Judging
///
/// **Core Responsibility:**
/// Compare raw runner output against expected values and record one
/// PerTestResult per test case.
///
/// **Critical Properties:**
/// - Knows nothing about processes, containers or HTTP
/// - Knows nothing about storage
/// - Pure function: (runner response, test case) → PerTestResult
///
/// **Matching Policy (first hit wins):**
/// 1. Structural equality of the original values
/// 2. Exact equality of normalized text
/// 3. Case-insensitive equality of normalized text
/// 4. Whitespace tokens: equal counts, and each pair equal, equal ignoring
///    case, or both numeric within 1e-6
///
/// **Normalization Rules:**
/// - Strip each line
/// - Trim leading/trailing blank lines
/// - Internal whitespace is preserved (token matching covers it)
use serde_json::Value;
use verifier_common::suite::{CallingConvention, TestCase};
use verifier_common::types::{PerTestResult, RunResponse, RunStatus};

use crate::literal::{python_str, rejoin_list_literal};

/// Printed by the function driver when the call matched.
pub const PASS_SENTINEL: &str = "PASSED";

/// Banner some remote sandboxes print before the program runs.
pub const SANDBOX_BANNER: &str = "User customization module loaded!";

const FLOAT_TOLERANCE: f64 = 1e-6;
const PREVIEW_CHARS: usize = 100;
const ERROR_CHARS: usize = 200;
const STDERR_CHARS: usize = 2000;

/// Strip every line and trim the whole.
pub fn normalize_output(output: &str) -> String {
    output
        .split('\n')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Fuzzy comparison of an expected value against program output.
pub fn check_match(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }

    let expected = normalize_output(&python_str(expected));
    let actual = normalize_output(&python_str(actual));

    if expected == actual {
        return true;
    }
    if expected.to_lowercase() == actual.to_lowercase() {
        return true;
    }

    let expected_tokens: Vec<&str> = expected.split_whitespace().collect();
    let actual_tokens: Vec<&str> = actual.split_whitespace().collect();
    if expected_tokens.len() != actual_tokens.len() {
        return false;
    }

    expected_tokens
        .iter()
        .zip(&actual_tokens)
        .all(|(e, a)| tokens_match(e, a))
}

fn tokens_match(expected: &str, actual: &str) -> bool {
    if expected == actual || expected.to_lowercase() == actual.to_lowercase() {
        return true;
    }
    match (expected.parse::<f64>(), actual.parse::<f64>()) {
        (Ok(e), Ok(a)) => (e - a).abs() < FLOAT_TOLERANCE,
        _ => false,
    }
}

/// Drop sandbox banner lines from stdout.
pub fn clean_sandbox_output(output: &str) -> String {
    output
        .split('\n')
        .filter(|line| line.trim() != SANDBOX_BANNER)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Last meaningful line of a function-driver run. Blank lines and echoed
/// `class`/`def` headers are ignored.
pub fn extract_function_output(stdout: &str) -> String {
    stdout
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .filter(|line| {
            let head = line.trim_start();
            !(head.starts_with("class ") || head.starts_with("def "))
        })
        .last()
        .map(|line| line.trim().to_string())
        .unwrap_or_default()
}

/// Expected stdout as text: list literals become one element per line.
pub fn expected_stdout(expected: &Value) -> String {
    let text = python_str(expected);
    let text = match expected {
        Value::String(s) => rejoin_list_literal(s).unwrap_or(text),
        _ => text,
    };
    normalize_output(&text)
}

/// First `max` characters.
pub fn preview(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Judge one runner response against its test case.
///
/// A run counts only if it finished with status success and exit code 0.
/// Otherwise the test fails with the stderr excerpt or a time limit note.
pub fn evaluate_test(
    index: usize,
    response: &RunResponse,
    convention: &CallingConvention,
    case: &TestCase,
) -> PerTestResult {
    let stdout = clean_sandbox_output(&response.stdout);
    let actual_stdout = stdout.trim();

    let (passed, error) = if response.succeeded() {
        match convention {
            CallingConvention::Function { .. } => {
                let actual = extract_function_output(actual_stdout);
                if check_match(&case.expected, &Value::String(actual.clone()))
                    || actual_stdout.contains(PASS_SENTINEL)
                {
                    (true, String::new())
                } else {
                    (
                        false,
                        format!(
                            "Expected: {}..., Got: {}...",
                            preview(&python_str(&case.expected), PREVIEW_CHARS),
                            preview(&actual, PREVIEW_CHARS)
                        ),
                    )
                }
            }
            CallingConvention::Stdio => {
                let expected = expected_stdout(&case.expected);
                let actual = normalize_output(actual_stdout);
                if check_match(&Value::String(expected.clone()), &Value::String(actual.clone())) {
                    (true, String::new())
                } else {
                    (
                        false,
                        format!(
                            "Expected: {}..., Got: {}...",
                            preview(&expected, PREVIEW_CHARS),
                            preview(&actual, PREVIEW_CHARS)
                        ),
                    )
                }
            }
        }
    } else if response.status == RunStatus::Timeout {
        (false, "Time limit exceeded".to_string())
    } else {
        (
            false,
            format!("Runtime Error: {}", preview(&response.stderr, ERROR_CHARS)),
        )
    };

    PerTestResult {
        index,
        passed,
        expected: preview(&python_str(&case.expected), PREVIEW_CHARS),
        actual: preview(actual_stdout, PREVIEW_CHARS),
        error,
        stderr: preview(&response.stderr, STDERR_CHARS),
        status: Some(response.status),
        return_code: response.return_code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_case(input: Value, expected: Value) -> TestCase {
        TestCase { input, expected }
    }

    fn make_response(stdout: &str, stderr: &str, return_code: i32) -> RunResponse {
        RunResponse {
            status: RunStatus::Success,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            return_code: Some(return_code),
        }
    }

    fn function() -> CallingConvention {
        CallingConvention::Function {
            name: "add".to_string(),
        }
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("  hello  "), "hello");
        assert_eq!(normalize_output("\n\na \n  b\n\n"), "a\nb");
        assert_eq!(normalize_output("a\r\nb\r\n"), "a\nb");
        assert_eq!(normalize_output("a\n\nb"), "a\n\nb");
    }

    #[test]
    fn test_match_structural_and_text() {
        assert!(check_match(&json!(5), &json!(5)));
        assert!(check_match(&json!(5), &json!("5")));
        assert!(check_match(&json!("Hello"), &json!("  Hello\n")));
        assert!(check_match(&json!("YES"), &json!("yes")));
        assert!(check_match(&json!([1, 2]), &json!("[1, 2]")));
        assert!(!check_match(&json!(5), &json!("6")));
    }

    #[test]
    fn test_match_float_tolerance() {
        assert!(check_match(&json!("1.0000001"), &json!("1.0000002")));
        assert!(!check_match(&json!("1.01"), &json!("1.02")));
        assert!(check_match(&json!(0.5), &json!("0.50000000")));
    }

    #[test]
    fn test_match_tokens() {
        assert!(check_match(&json!("1   2\n3"), &json!("1 2 3")));
        assert!(check_match(&json!("Yes 2.0"), &json!("YES 2")));
        assert!(!check_match(&json!("1 2 3"), &json!("1 2")));
        assert!(!check_match(&json!("a b"), &json!("a c")));
        // NaN never equals itself numerically, only textually
        assert!(check_match(&json!("nan 1"), &json!("nan 1")));
        assert!(!check_match(&json!("nan 1"), &json!("NaN 2")));
    }

    #[test]
    fn test_extract_function_output() {
        assert_eq!(extract_function_output("5\n"), "5");
        assert_eq!(
            extract_function_output("class Solution:\ndef add(a, b):\n  42  \n\n"),
            "42"
        );
        assert_eq!(extract_function_output("1\n    def x():\n"), "1");
        assert_eq!(extract_function_output("\n  \n"), "");
        // "define" is not a definition header
        assert_eq!(extract_function_output("define x\n"), "define x");
    }

    #[test]
    fn test_clean_sandbox_output() {
        let raw = "User customization module loaded!\n6\n";
        assert_eq!(clean_sandbox_output(raw), "6\n");
        assert_eq!(clean_sandbox_output("a\nb"), "a\nb");
    }

    #[test]
    fn test_expected_stdout_rejoins_lists() {
        assert_eq!(expected_stdout(&json!("[1, 2, 3]")), "1\n2\n3");
        assert_eq!(expected_stdout(&json!("['YES', 'NO']\n")), "YES\nNO");
        assert_eq!(expected_stdout(&json!("[not a literal]")), "[not a literal]");
        assert_eq!(expected_stdout(&json!(6)), "6");
        assert_eq!(expected_stdout(&json!("6\n")), "6");
    }

    #[test]
    fn test_evaluate_stdio_pass() {
        let case = make_case(json!("3\n"), json!("6\n"));
        let result = evaluate_test(0, &make_response("6\n", "", 0), &CallingConvention::Stdio, &case);
        assert!(result.passed);
        assert_eq!(result.error, "");
        assert_eq!(result.actual, "6");
        assert_eq!(result.expected, "6\n");
        assert_eq!(result.status, Some(RunStatus::Success));
    }

    #[test]
    fn test_evaluate_stdio_mismatch() {
        let case = make_case(json!("3\n"), json!("6\n"));
        let result = evaluate_test(2, &make_response("7\n", "", 0), &CallingConvention::Stdio, &case);
        assert!(!result.passed);
        assert_eq!(result.index, 2);
        assert_eq!(result.error, "Expected: 6..., Got: 7...");
    }

    #[test]
    fn test_evaluate_stdio_list_expectation() {
        let case = make_case(json!("2\n"), json!("['a', 'b']"));
        let result = evaluate_test(0, &make_response("a\nb\n", "", 0), &CallingConvention::Stdio, &case);
        assert!(result.passed);
    }

    #[test]
    fn test_evaluate_function_sentinel() {
        let case = make_case(json!([2, 3]), json!(5));
        let result = evaluate_test(0, &make_response("PASSED\n", "", 0), &function(), &case);
        assert!(result.passed);
    }

    #[test]
    fn test_evaluate_function_failure_sentinel() {
        let case = make_case(json!([2, 3]), json!(5));
        let response = make_response("FAILED\n", "FAILED: Expected 5, got 6\n", 0);
        let result = evaluate_test(0, &response, &function(), &case);
        assert!(!result.passed);
        assert_eq!(result.error, "Expected: 5..., Got: FAILED...");
        assert!(result.stderr.contains("got 6"));
    }

    #[test]
    fn test_evaluate_function_runtime_error_detail() {
        let case = make_case(json!([2, 3]), json!(5));
        let response = make_response("RUNTIME ERROR\n", "RUNTIME ERROR: boom\n", 0);
        let result = evaluate_test(0, &response, &function(), &case);
        assert!(!result.passed);
        assert_eq!(result.actual, "RUNTIME ERROR");
        assert!(result.stderr.contains("RUNTIME ERROR: boom"));
    }

    #[test]
    fn test_evaluate_non_zero_exit() {
        let case = make_case(json!("1\n"), json!("1\n"));
        let traceback = "Traceback (most recent call last):\nValueError";
        let result = evaluate_test(0, &make_response("1\n", traceback, 1), &CallingConvention::Stdio, &case);
        assert!(!result.passed);
        assert_eq!(result.error, format!("Runtime Error: {}", traceback));
        assert_eq!(result.return_code, Some(1));
    }

    #[test]
    fn test_evaluate_timeout() {
        let case = make_case(json!("1\n"), json!("1\n"));
        let result = evaluate_test(0, &RunResponse::timeout(), &CallingConvention::Stdio, &case);
        assert!(!result.passed);
        assert_eq!(result.error, "Time limit exceeded");
        assert_eq!(result.status, Some(RunStatus::Timeout));
    }

    #[test]
    fn test_previews_are_truncated() {
        let long = "x".repeat(5000);
        let case = make_case(json!(""), json!(long.clone()));
        let response = make_response(&long, &long, 1);
        let result = evaluate_test(0, &response, &CallingConvention::Stdio, &case);
        assert_eq!(result.expected.len(), 100);
        assert_eq!(result.actual.len(), 100);
        assert_eq!(result.stderr.len(), 2000);
        assert_eq!(result.error.len(), "Runtime Error: ".len() + 200);
    }
}
