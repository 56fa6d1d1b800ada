/// Harness Builder - Program Text Synthesis
///
/// **Responsibility:**
/// Turn (candidate source, test case) into the exact program and stdin that
/// a runner executes.
///
/// **Function convention:**
/// prelude + candidate source + a driver that calls the target function with
/// the test's argument tuple and prints a sentinel:
/// - `PASSED` when the result equals the expected value, or the expected value
///   is a one-element list holding the result
/// - `FAILED` otherwise, with the explanation on stderr
/// - `RUNTIME ERROR` when the call raises, with the message on stderr
///
/// The driver never exits non-zero on its own; the comparison in the
/// evaluator makes the final call.
///
/// **Stdio convention:**
/// prelude + candidate source; the test input becomes stdin.
use regex::Regex;
use serde_json::Value;
use verifier_common::suite::{CallingConvention, TestCase};

use crate::literal::{python_repr, python_str};

/// Standard-library names generated solutions assume are already imported.
pub const IMPORT_PRELUDE: &str = "from string import *\nfrom re import *\nfrom datetime import *\nfrom collections import *\nfrom heapq import *\nfrom bisect import *\nfrom copy import *\nfrom math import *\nfrom random import *\nfrom statistics import *\nfrom itertools import *\nfrom functools import *\nfrom operator import *\nfrom io import *\nfrom sys import *\nfrom json import *\nfrom builtins import *\nfrom typing import *\nimport string\nimport re\nimport datetime\nimport collections\nimport heapq\nimport bisect\nimport copy\nimport math\nimport random\nimport statistics\nimport itertools\nimport functools\nimport operator\nimport io\nimport sys\nimport json\nsys.setrecursionlimit(50000)\n";

/// Deep recursion is common in accepted solutions.
const RECURSION_LIMIT: &str = "sys.setrecursionlimit(50000)\n";

/// Lifts the int/str conversion cap on interpreters that have one.
const INT_DIGITS_LIMIT: &str =
    "if hasattr(sys, \"set_int_max_str_digits\"):\n    sys.set_int_max_str_digits(100000)\n";

/// Container type whose methods are called through an instance.
const SOLUTION_CLASS: &str = "Solution";

/// Program text and stdin for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Harness {
    pub program: String,
    pub stdin: String,
}

#[derive(Debug, Clone)]
pub struct HarnessBuilder {
    prelude: String,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::with_prelude(IMPORT_PRELUDE)
    }
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom import block. The recursion and digit limits are always
    /// appended after it.
    pub fn with_prelude(imports: impl Into<String>) -> Self {
        let mut prelude = imports.into();
        if !prelude.is_empty() && !prelude.ends_with('\n') {
            prelude.push('\n');
        }
        prelude.push_str("import sys\n");
        prelude.push_str(RECURSION_LIMIT);
        prelude.push_str(INT_DIGITS_LIMIT);
        Self { prelude }
    }

    pub fn prelude(&self) -> &str {
        &self.prelude
    }

    /// Build the harness for one test case. `call_target` comes from
    /// [`call_target`] and is computed once per candidate.
    pub fn build(
        &self,
        source: &str,
        convention: &CallingConvention,
        call_target: &str,
        case: &TestCase,
    ) -> Harness {
        match convention {
            CallingConvention::Function { .. } => Harness {
                program: self.function_program(source, call_target, &case.input, &case.expected),
                stdin: String::new(),
            },
            CallingConvention::Stdio => Harness {
                program: self.stdio_program(source),
                stdin: stdin_text(&case.input),
            },
        }
    }

    pub fn function_program(
        &self,
        source: &str,
        call_target: &str,
        input: &Value,
        expected: &Value,
    ) -> String {
        let args = python_repr(&normalize_arguments(input));
        let expected = python_repr(expected);

        format!(
            r#"{prelude}
{source}

try:
    _harness_args = {args}
    _harness_expected = {expected}

    _harness_result = {call_target}(*_harness_args)

    if _harness_result == _harness_expected:
        print("PASSED")
    elif isinstance(_harness_expected, list) and len(_harness_expected) == 1 and _harness_expected[0] == _harness_result:
        print("PASSED")
    else:
        print("FAILED")
        print(f"FAILED: Expected {{_harness_expected}}, got {{_harness_result}}", file=sys.stderr)
except Exception as _harness_error:
    print("RUNTIME ERROR")
    print(f"RUNTIME ERROR: {{_harness_error}}", file=sys.stderr)
"#,
            prelude = self.prelude,
        )
    }

    pub fn stdio_program(&self, source: &str) -> String {
        format!("{}\n{}", self.prelude, source)
    }
}

/// The expression the driver calls: `Solution().name` when `name` is
/// defined inside a `Solution` class, else the bare name.
pub fn call_target(source: &str, fn_name: &str) -> String {
    let pattern = format!(
        r"class\s+{}\s*(?:\([^)]*\))?\s*:(?s:.)*?def\s+{}\s*\(",
        SOLUTION_CLASS,
        regex::escape(fn_name)
    );
    match Regex::new(&pattern) {
        Ok(re) if re.is_match(source) => format!("{}().{}", SOLUTION_CLASS, fn_name),
        _ => fn_name.to_string(),
    }
}

/// Argument tuples arrive in inconsistent shapes. A single-element list
/// holding a list is unwrapped one level; if that inner list ends in two
/// empty-list placeholders, every empty list is dropped from it as well.
/// Everything else passes through unchanged.
pub fn normalize_arguments(input: &Value) -> Value {
    let Value::Array(outer) = input else {
        return input.clone();
    };
    let [Value::Array(inner)] = outer.as_slice() else {
        return input.clone();
    };

    let is_placeholder = |v: &Value| matches!(v, Value::Array(items) if items.is_empty());
    let trailing_placeholders = inner.len() >= 2 && inner[inner.len() - 2..].iter().all(is_placeholder);

    if trailing_placeholders {
        Value::Array(inner.iter().filter(|v| !is_placeholder(v)).cloned().collect())
    } else {
        Value::Array(inner.clone())
    }
}

/// Stdin for a stdio test: strings verbatim, lists one element per line,
/// anything else rendered as Python would print it.
pub fn stdin_text(input: &Value) -> String {
    match input {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines.iter().map(python_str).collect::<Vec<_>>().join("\n"),
        other => python_str(other),
    }
}
