// Command-line configuration for the verifier binary
use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use verifier_common::config::{
    ExecutionLimits, DEFAULT_BATCH_SIZE, DEFAULT_COMPILE_TIMEOUT_SECS, DEFAULT_CONCURRENCY,
    DEFAULT_LANGUAGE, DEFAULT_LIMIT, DEFAULT_MEMORY_LIMIT_MB, DEFAULT_REDIS_URL,
    DEFAULT_RUN_TIMEOUT_SECS,
};
use verifier_common::types::StatusFilter;
use verifier_runner::docker::DEFAULT_IMAGE;
use verifier_runner::{CodeRunner, DockerRunner, LocalRunner, RemoteRunner};

use crate::offline::DumpSettings;
use crate::orchestrator::OrchestratorSettings;

/// Where candidate programs run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunnerKind {
    /// Isolated child process on this host
    Local,
    /// External execution service speaking the /run_code protocol
    Remote,
    /// One throwaway container per execution
    Docker,
}

#[derive(Debug, Clone, Args)]
pub struct RunnerArgs {
    /// Execution backend
    #[arg(long, value_enum, default_value_t = RunnerKind::Local)]
    pub runner: RunnerKind,

    /// Execution service URL (remote runner)
    #[arg(long, env = "SANDBOX_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Python interpreter (local runner)
    #[arg(long, env = "PYTHON_BIN", default_value = "python3")]
    pub python: PathBuf,

    /// Container image (docker runner)
    #[arg(long, env = "SANDBOX_IMAGE", default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// Language forwarded to the runner
    #[arg(long, default_value = DEFAULT_LANGUAGE)]
    pub language: String,

    /// Wall-clock seconds per execution
    #[arg(long, default_value_t = DEFAULT_RUN_TIMEOUT_SECS)]
    pub run_timeout: f64,

    /// Start-up / compile seconds per execution
    #[arg(long, default_value_t = DEFAULT_COMPILE_TIMEOUT_SECS)]
    pub compile_timeout: f64,

    /// Address-space limit per execution in MiB
    #[arg(long, default_value_t = DEFAULT_MEMORY_LIMIT_MB)]
    pub memory_mb: u64,
}

impl RunnerArgs {
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits::new(self.run_timeout, self.compile_timeout, self.memory_mb)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_timeout.is_nan() || self.run_timeout <= 0.0 {
            bail!("--run-timeout must be positive (got {})", self.run_timeout);
        }
        if self.compile_timeout.is_nan() || self.compile_timeout < 0.0 {
            bail!("--compile-timeout must not be negative (got {})", self.compile_timeout);
        }
        if self.memory_mb == 0 {
            bail!("--memory-mb must be at least 1");
        }
        if self.runner == RunnerKind::Remote && self.endpoint_value().is_none() {
            bail!("The remote runner needs --endpoint or SANDBOX_ENDPOINT");
        }
        Ok(())
    }

    fn endpoint_value(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }

    pub fn build_runner(&self) -> Result<Arc<dyn CodeRunner>> {
        self.validate()?;
        let runner: Arc<dyn CodeRunner> = match self.runner {
            RunnerKind::Local => {
                let runner = LocalRunner::new(&self.python);
                if !runner.is_available() {
                    bail!("Python interpreter not found: {}", self.python.display());
                }
                info!(python = %runner.python().display(), "Using local runner");
                Arc::new(runner)
            }
            RunnerKind::Remote => {
                let endpoint = self
                    .endpoint_value()
                    .context("The remote runner needs --endpoint or SANDBOX_ENDPOINT")?;
                let runner = RemoteRunner::new(endpoint)?;
                info!(url = %runner.url(), "Using remote runner");
                Arc::new(runner)
            }
            RunnerKind::Docker => {
                let runner = DockerRunner::connect(self.image.clone())
                    .context("Failed to connect to Docker")?;
                info!(image = %runner.image(), "Using docker runner");
                Arc::new(runner)
            }
        };
        Ok(runner)
    }
}

#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// Candidate store
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,
}

#[derive(Debug, Clone, Args)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub runner: RunnerArgs,

    /// Maximum number of candidates to verify
    #[arg(long, default_value_t = DEFAULT_LIMIT)]
    pub limit: usize,

    /// Skip the first N eligible candidates
    #[arg(long, default_value_t = 0)]
    pub offset: usize,

    /// Candidates verified at once
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Parallel store readers
    #[arg(long, default_value_t = 1)]
    pub reader_workers: usize,

    /// Verdicts per store write
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Statuses to (re)verify, comma-separated; `null` for unset, `all` for
    /// everything not passed. Default: pending,error,null
    #[arg(long, value_parser = parse_statuses)]
    pub retry_status: Option<StatusFilter>,

    /// Verify without writing to the store
    #[arg(long)]
    pub dryrun: bool,

    /// Write offline tasks to FILE instead of verifying
    #[arg(long, value_name = "FILE", conflicts_with = "ingest_results")]
    pub dump_tasks: Option<PathBuf>,

    /// Persist offline result files instead of verifying
    #[arg(long, value_name = "FILE", num_args = 1..)]
    pub ingest_results: Vec<PathBuf>,

    /// Append one JSON line per failed or errored candidate
    #[arg(long, value_name = "FILE")]
    pub failure_log: Option<PathBuf>,
}

impl VerifyArgs {
    pub fn statuses(&self) -> StatusFilter {
        self.retry_status.clone().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        ensure_positive("--concurrency", self.concurrency)?;
        ensure_positive("--batch-size", self.batch_size)?;
        ensure_positive("--reader-workers", self.reader_workers)?;
        if self.dump_tasks.is_some() && !self.ingest_results.is_empty() {
            bail!("--dump-tasks and --ingest-results cannot be combined");
        }
        // the runner is only needed when something executes
        if self.dump_tasks.is_none() && self.ingest_results.is_empty() {
            self.runner.validate()?;
        }
        Ok(())
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            statuses: self.statuses(),
            limit: Some(self.limit),
            offset: self.offset,
            concurrency: self.concurrency,
            reader_workers: self.reader_workers,
            batch_size: self.batch_size,
            dry_run: self.dryrun,
            failure_log: self.failure_log.clone(),
        }
    }

    pub fn dump_settings(&self, import_string: &str) -> DumpSettings {
        DumpSettings {
            statuses: self.statuses(),
            limit: Some(self.limit),
            offset: self.offset,
            reader_workers: self.reader_workers,
            language: self.runner.language.clone(),
            import_string: import_string.to_string(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct RunTasksArgs {
    #[command(flatten)]
    pub runner: RunnerArgs,

    /// Task file written by `verify --dump-tasks`
    #[arg(long, value_name = "FILE")]
    pub tasks: PathBuf,

    /// This worker's index
    #[arg(long, default_value_t = 0)]
    pub rank: usize,

    /// Total number of workers
    #[arg(long, default_value_t = 1)]
    pub world_size: usize,

    /// Directory for the results file
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// Tasks verified at once
    #[arg(long, default_value_t = 1)]
    pub concurrency: usize,
}

impl RunTasksArgs {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("--world-size", self.world_size)?;
        ensure_positive("--concurrency", self.concurrency)?;
        if self.rank >= self.world_size {
            bail!(
                "Rank {} must be between 0 and {}",
                self.rank,
                self.world_size - 1
            );
        }
        self.runner.validate()
    }
}

fn ensure_positive(flag: &str, value: usize) -> Result<()> {
    if value == 0 {
        bail!("{} must be at least 1", flag);
    }
    Ok(())
}

pub fn parse_statuses(raw: &str) -> Result<StatusFilter, String> {
    StatusFilter::parse(raw).map_err(|e| e.to_string())
}
