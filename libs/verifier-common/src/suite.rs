use serde_json::Value;
use thiserror::Error;

use crate::types::Problem;

/// How a problem's tests talk to the candidate program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallingConvention {
    /// Call a named function with an argument tuple and compare the return value.
    Function { name: String },
    /// Feed the input on stdin and compare stdout.
    Stdio,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub input: Value,
    pub expected: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestSuite {
    pub convention: CallingConvention,
    pub cases: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TestDataError {
    #[error("Failed to parse test_cases JSON")]
    Unparseable,
    #[error("No test cases found or unrecognized format")]
    Missing,
}

impl TestSuite {
    /// Parse a stored `test_cases` payload.
    ///
    /// Upstream storage sometimes encodes the object as a JSON string, and
    /// sometimes encodes that string once more. Both layers are peeled off.
    pub fn parse(raw: &Value) -> Result<Self, TestDataError> {
        let decoded = match raw {
            Value::String(text) => {
                let once: Value =
                    serde_json::from_str(text).map_err(|_| TestDataError::Unparseable)?;
                match once {
                    Value::String(inner) => {
                        serde_json::from_str(&inner).map_err(|_| TestDataError::Unparseable)?
                    }
                    other => other,
                }
            }
            other => other.clone(),
        };

        let Value::Object(mut map) = decoded else {
            return Err(TestDataError::Missing);
        };

        let convention = match map.get("fn_name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => CallingConvention::Function {
                name: name.to_string(),
            },
            _ => CallingConvention::Stdio,
        };

        let (Some(Value::Array(inputs)), Some(Value::Array(outputs))) =
            (map.remove("inputs"), map.remove("outputs"))
        else {
            return Err(TestDataError::Missing);
        };

        // zip truncates to the shorter side
        let cases: Vec<TestCase> = inputs
            .into_iter()
            .zip(outputs)
            .map(|(input, expected)| TestCase { input, expected })
            .collect();

        if cases.is_empty() {
            return Err(TestDataError::Missing);
        }

        Ok(Self { convention, cases })
    }

    pub fn function_name(&self) -> Option<&str> {
        match &self.convention {
            CallingConvention::Function { name } => Some(name),
            CallingConvention::Stdio => None,
        }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl Problem {
    pub fn test_suite(&self) -> Result<TestSuite, TestDataError> {
        TestSuite::parse(&self.test_cases)
    }
}
