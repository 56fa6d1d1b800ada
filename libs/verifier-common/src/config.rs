// Execution defaults shared by the worker, the runners and the sandbox service

use std::time::Duration;

pub const DEFAULT_LANGUAGE: &str = "python";
pub const DEFAULT_RUN_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_COMPILE_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;
const MAX_TIMEOUT_SECS: f64 = 86_400.0;

pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_LIMIT: usize = 10_000;
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Bounds applied to a single execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionLimits {
    pub run_timeout: Duration,
    pub compile_timeout: Duration,
    pub memory_limit_mb: u64,
}

impl ExecutionLimits {
    pub fn new(run_timeout_secs: f64, compile_timeout_secs: f64, memory_limit_mb: u64) -> Self {
        Self {
            run_timeout: secs(run_timeout_secs),
            compile_timeout: secs(compile_timeout_secs),
            memory_limit_mb,
        }
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::new(
            DEFAULT_RUN_TIMEOUT_SECS,
            DEFAULT_COMPILE_TIMEOUT_SECS,
            DEFAULT_MEMORY_LIMIT_MB,
        )
    }
}

/// Non-positive and NaN values become zero; huge values are clamped.
fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(value.min(MAX_TIMEOUT_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.run_timeout, Duration::from_secs(10));
        assert_eq!(limits.memory_limit_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_bad_timeouts_do_not_panic() {
        let limits = ExecutionLimits::new(f64::NAN, -1.0, 64);
        assert_eq!(limits.run_timeout, Duration::ZERO);
        assert_eq!(limits.compile_timeout, Duration::ZERO);
        let limits = ExecutionLimits::new(f64::INFINITY, 1e30, 64);
        assert_eq!(limits.run_timeout, Duration::from_secs(86_400));
    }
}
