//! Local runner - one confined OS process per call.
//!
//! Every call gets:
//! - a fresh scratch directory (removed on drop) with an empty `work/` cwd
//! - a cleared environment and a new session
//! - CPU, address-space, file-size and fd limits
//! - a seccomp filter against process creation (threads still work), or
//!   `RLIMIT_NPROC = 0` where the filter cannot be installed
//! - no-new-privs and, where unprivileged namespaces are allowed, an empty
//!   network namespace
//! - the least-privilege bootstrap in front of the program

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};
use verifier_common::types::{RunRequest, RunResponse, RunStatus};

use crate::bootstrap::{launcher_args, BOOTSTRAP_FILE, BOOTSTRAP_SOURCE, PROGRAM_FILE};
use crate::seccomp::ProcessFilter;
use crate::{check_language, check_request_size, guard, CodeRunner, RunnerError};

/// Per-stream capture limit; anything beyond is drained and discarded
pub const DEFAULT_OUTPUT_CAP: usize = 16 * 1024 * 1024;

const MAX_FILE_BYTES: u64 = 64 * 1024 * 1024;
const MAX_OPEN_FILES: u64 = 64;
const MAX_RUN_SECS: f64 = 86_400.0;

/// How long to wait for pipes to close after the process exits
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LocalRunner {
    python: PathBuf,
    output_cap: usize,
    isolate_network: bool,
}

impl LocalRunner {
    /// `python` may be a bare name; it is resolved against `PATH` now because
    /// the child runs with an empty environment.
    pub fn new(python: impl Into<PathBuf>) -> Self {
        let python = python.into();
        Self {
            python: resolve_executable(&python).unwrap_or(python),
            output_cap: DEFAULT_OUTPUT_CAP,
            isolate_network: true,
        }
    }

    pub fn with_output_cap(mut self, cap: usize) -> Self {
        self.output_cap = cap;
        self
    }

    pub fn with_network_isolation(mut self, enabled: bool) -> Self {
        self.isolate_network = enabled;
        self
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    /// Whether the interpreter exists on this host.
    pub fn is_available(&self) -> bool {
        self.python.is_absolute() && self.python.is_file()
    }

    async fn run_confined(&self, request: &RunRequest) -> Result<RunResponse, RunnerError> {
        let scratch = match ScratchDir::create() {
            Ok(dir) => dir,
            Err(e) => {
                return Ok(RunResponse::infra_error(format!(
                    "Failed to create scratch directory: {}",
                    e
                )))
            }
        };

        let program = scratch.path().join(PROGRAM_FILE);
        let bootstrap = scratch.path().join(BOOTSTRAP_FILE);
        tokio::fs::write(&program, &request.code).await?;
        tokio::fs::write(&bootstrap, BOOTSTRAP_SOURCE).await?;

        let run_timeout = Duration::from_secs_f64(request.run_timeout.max(0.0).min(MAX_RUN_SECS));
        let confinement = Confinement {
            cpu_secs: run_timeout.as_secs_f64().ceil() as u64 + 1,
            address_space: request.memory_limit_mb.unwrap_or(0).saturating_mul(1024 * 1024),
            isolate_network: self.isolate_network,
        };

        let work_dir = scratch.work_dir();
        let mut cmd = Command::new(&self.python);
        cmd.args(launcher_args(&bootstrap, &program, scratch.path()))
            .current_dir(&work_dir)
            .env_clear()
            .env("HOME", &work_dir)
            .env("TMPDIR", &work_dir)
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let filter = ProcessFilter::new();
            unsafe {
                cmd.pre_exec(move || confinement.apply(filter.as_ref()));
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(RunResponse::infra_error(format!(
                    "Failed to spawn {}: {}",
                    self.python.display(),
                    e
                )))
            }
        };
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            let input = request.stdin.clone().into_bytes();
            tokio::spawn(async move {
                // the program may exit without reading its input
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "Stdin not fully consumed");
                }
            });
        }

        let cap = self.output_cap;
        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), cap));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), cap));

        let started = Instant::now();
        let status = match tokio::time::timeout(run_timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                kill_group(pid);
                return Ok(RunResponse::infra_error(format!(
                    "Failed to wait for sandbox process: {}",
                    e
                )));
            }
            Err(_) => {
                debug!(timeout_ms = run_timeout.as_millis() as u64, "Execution timed out, killing process group");
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Process already gone");
                }
                stdout_task.abort();
                stderr_task.abort();
                return Ok(RunResponse::timeout());
            }
        };

        let (stdout, stdout_truncated) = drain(stdout_task).await;
        let (mut stderr, stderr_truncated) = drain(stderr_task).await;
        if stdout_truncated || stderr_truncated {
            stderr.push_str("\n[output truncated]");
        }

        let (return_code, signal) = exit_status(&status);
        debug!(
            return_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sandbox process exited"
        );

        if signal == Some(SIGXCPU) {
            return Ok(RunResponse::timeout());
        }

        Ok(RunResponse {
            status: RunStatus::Success,
            stdout,
            stderr,
            return_code: Some(return_code),
        })
    }
}

#[async_trait]
impl CodeRunner for LocalRunner {
    async fn execute(&self, request: &RunRequest) -> Result<RunResponse, RunnerError> {
        check_request_size(request)?;
        check_language(&request.language)?;

        if let Err(violation) = guard::scan(&request.code) {
            debug!(%violation, "Static guard rejected program");
            return Ok(RunResponse {
                status: RunStatus::Success,
                stdout: String::new(),
                stderr: format!("SecurityError: {}", violation),
                return_code: Some(1),
            });
        }

        self.run_confined(request).await
    }
}

/// Scratch directory guard - removes the directory even if the call is
/// cancelled mid-flight.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create() -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!("verifier-sandbox-{}", uuid::Uuid::new_v4()));

        let mut builder = std::fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&path)?;

        let scratch = Self { path };
        builder.create(scratch.work_dir())?;
        Ok(scratch)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn work_dir(&self) -> PathBuf {
        self.path.join("work")
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory");
        }
    }
}

/// Limits applied in the child between fork and exec. Only async-signal-safe
/// calls are allowed in there, so everything is precomputed.
#[derive(Debug, Clone, Copy)]
struct Confinement {
    cpu_secs: u64,
    /// 0 means no address-space limit
    address_space: u64,
    isolate_network: bool,
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type Resource = libc::c_int;

#[cfg(unix)]
const SIGXCPU: i32 = libc::SIGXCPU;
#[cfg(not(unix))]
const SIGXCPU: i32 = 24;

#[cfg(unix)]
impl Confinement {
    fn apply(&self, filter: Option<&ProcessFilter>) -> std::io::Result<()> {
        unsafe {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
                if self.isolate_network {
                    // unprivileged namespaces are often disabled; run without one then
                    let _ = libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET);
                }
            }

            set_limit(libc::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
            #[cfg(target_os = "linux")]
            if self.address_space > 0 {
                set_limit(libc::RLIMIT_AS, self.address_space, self.address_space)?;
            }
            set_limit(libc::RLIMIT_FSIZE, MAX_FILE_BYTES, MAX_FILE_BYTES)?;
            set_limit(libc::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;
            set_limit(libc::RLIMIT_CORE, 0, 0)?;

            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            let filtered = match filter {
                Some(filter) => filter.install().is_ok(),
                None => false,
            };
            if !filtered {
                // also blocks threads for non-root users
                set_limit(libc::RLIMIT_NPROC, 0, 0)?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
unsafe fn set_limit(resource: Resource, soft: u64, hard: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if libc::setrlimit(resource, &limit) != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // the child called setsid, so its pid is the process group id
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Exit code, or 128 + signal for signal deaths.
fn exit_status(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (128 + signal, Some(signal));
        }
    }
    (-1, None)
}

async fn read_capped<R>(reader: Option<R>, cap: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };

    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
        if n > room {
            truncated = true;
        }
    }
    Ok((buf, truncated))
}

async fn drain(
    task: tokio::task::JoinHandle<std::io::Result<(Vec<u8>, bool)>>,
) -> (String, bool) {
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(Ok((bytes, truncated)))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Failed to read sandbox output");
            (String::new(), false)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader panicked");
            (String::new(), false)
        }
        Err(_) => {
            warn!("Output pipe still open after exit");
            (String::new(), true)
        }
    }
}

fn resolve_executable(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.canonicalize().ok();
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use verifier_common::config::ExecutionLimits;

    fn runner() -> Option<LocalRunner> {
        let runner = LocalRunner::new("python3");
        if runner.is_available() {
            Some(runner)
        } else {
            eprintln!("python3 not found on PATH, skipping");
            None
        }
    }

    fn request(code: &str, stdin: &str) -> RunRequest {
        RunRequest::new(code, stdin, "python", &ExecutionLimits::new(5.0, 5.0, 512))
    }

    #[tokio::test]
    async fn test_runs_program_with_stdin() {
        let Some(runner) = runner() else { return };
        let response = runner
            .execute(&request("n = int(input())\nprint(n * 2)", "3\n"))
            .await
            .unwrap();
        assert_eq!(response.status, RunStatus::Success);
        assert_eq!(response.return_code, Some(0));
        assert_eq!(response.stdout, "6\n");
    }

    #[tokio::test]
    async fn test_runtime_error_is_not_infra_error() {
        let Some(runner) = runner() else { return };
        let response = runner.execute(&request("print(1 // 0)", "")).await.unwrap();
        assert_eq!(response.status, RunStatus::Success);
        assert_eq!(response.return_code, Some(1));
        assert!(response.stderr.contains("ZeroDivisionError"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let Some(runner) = runner() else { return };
        let mut req = request("while True:\n    pass", "");
        req.run_timeout = 0.5;
        let started = Instant::now();
        let response = runner.execute(&req).await.unwrap();
        assert_eq!(response.status, RunStatus::Timeout);
        assert!(response.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_static_guard_rejects_before_spawn() {
        // no interpreter needed: the guard runs first
        let runner = LocalRunner::new("/nonexistent/python3");
        let response = runner
            .execute(&request("print(eval('1 + 1'))", ""))
            .await
            .unwrap();
        assert_eq!(response.status, RunStatus::Success);
        assert_eq!(response.return_code, Some(1));
        assert!(response.stderr.starts_with("SecurityError:"));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_infra_error() {
        let runner = LocalRunner::new("/nonexistent/python3");
        let response = runner.execute(&request("print(1)", "")).await.unwrap();
        assert_eq!(response.status, RunStatus::InfraError);
    }

    #[tokio::test]
    async fn test_builtins_are_restricted() {
        let Some(runner) = runner() else { return };
        let response = runner
            .execute(&request("print('eval' in __builtins__, 'print' in __builtins__)", ""))
            .await
            .unwrap();
        assert_eq!(response.stdout.trim(), "False True");
    }

    #[tokio::test]
    async fn test_blocked_import_and_confined_open() {
        let Some(runner) = runner() else { return };

        let response = runner.execute(&request("import subprocess", "")).await.unwrap();
        assert_eq!(response.return_code, Some(1));
        assert!(response.stderr.contains("not allowed"));

        let response = runner
            .execute(&request("print(open('/etc/hostname').read())", ""))
            .await
            .unwrap();
        assert_eq!(response.return_code, Some(1));
        assert!(response.stderr.contains("PermissionError"));

        let code = "with open('out.txt', 'w') as f:\n    f.write('ok')\nprint(open('out.txt').read())";
        let response = runner.execute(&request(code, "")).await.unwrap();
        assert_eq!(response.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn test_os_view_hides_process_control() {
        let Some(runner) = runner() else { return };
        let code = "import os\nprint(hasattr(os, 'system'), hasattr(os, 'path'))";
        let response = runner.execute(&request(code, "")).await.unwrap();
        assert_eq!(response.stdout.trim(), "False True");
    }

    #[tokio::test]
    async fn test_threads_can_be_started() {
        let Some(runner) = runner() else { return };
        let code = r#"
import sys
import threading

def solve():
    sys.setrecursionlimit(100000)
    def depth(n):
        return 0 if n == 0 else 1 + depth(n - 1)
    print(depth(int(input())))

threading.stack_size(64 * 1024 * 1024)
worker = threading.Thread(target=solve)
worker.start()
worker.join()
"#;
        let response = runner.execute(&request(code, "20000\n")).await.unwrap();
        assert_eq!(response.status, RunStatus::Success, "{}", response.stderr);
        assert_eq!(response.return_code, Some(0), "{}", response.stderr);
        assert_eq!(response.stdout, "20000\n");
    }

    #[tokio::test]
    async fn test_output_cap() {
        let Some(runner) = runner() else { return };
        let runner = runner.with_output_cap(10);
        let response = runner
            .execute(&request("print('x' * 1000)", ""))
            .await
            .unwrap();
        assert_eq!(response.stdout.len(), 10);
        assert!(response.stderr.contains("[output truncated]"));
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let runner = LocalRunner::new("python3");
        let req = request(&"#".repeat(crate::MAX_SOURCE_CODE_BYTES + 1), "");
        assert!(matches!(
            runner.execute(&req).await,
            Err(RunnerError::RequestTooLarge(_))
        ));
    }

    #[test]
    fn test_scratch_dir_is_removed_on_drop() {
        let scratch = ScratchDir::create().unwrap();
        let path = scratch.path().to_path_buf();
        assert!(scratch.work_dir().is_dir());
        drop(scratch);
        assert!(!path.exists());
    }
}
