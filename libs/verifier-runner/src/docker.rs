//! Docker runner - one throwaway container per call.
//!
//! **Container rules:**
//! 1. Pulls the image if it is not cached locally
//! 2. Creates the container with:
//!    - network disabled
//!    - memory, CPU and pids limits
//!    - all capabilities dropped, no-new-privileges
//! 3. Ships program, bootstrap and stdin base64-encoded in the environment
//! 4. Captures stdout/stderr from the log stream
//! 5. Kills the container on wall-clock timeout
//! 6. Removes the container on drop, even if the call is cancelled

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use verifier_common::types::{RunRequest, RunResponse, RunStatus};

use crate::bootstrap::BOOTSTRAP_SOURCE;
use crate::local::DEFAULT_OUTPUT_CAP;
use crate::{check_language, check_request_size, guard, CodeRunner, RunnerError};

pub const DEFAULT_IMAGE: &str = "python:3.11-slim";

/// Docker rejects oversized environments; each encoded value stays below this
const MAX_ENV_VALUE_BYTES: usize = 128 * 1024;
const PIDS_LIMIT: i64 = 64;
const NANO_CPUS: i64 = 1_000_000_000; // 1 CPU
const MAX_WALL_SECS: f64 = 86_400.0;

/// Decodes the payload inside the container and execs the bootstrap with an
/// empty environment and the decoded stdin on fd 0.
const LAUNCHER: &str = r#"import base64, os, sys
root = "/tmp/sandbox"
os.makedirs(root + "/work", exist_ok=True)
for name, var in (("solution.py", "SOURCE_CODE"), ("bootstrap.py", "BOOTSTRAP"), ("stdin.txt", "TEST_INPUT")):
    with open(os.path.join(root, name), "wb") as handle:
        handle.write(base64.b64decode(os.environ.get(var, "")))
fd = os.open(root + "/stdin.txt", os.O_RDONLY)
os.dup2(fd, 0)
os.chdir(root + "/work")
env = {"HOME": root + "/work", "PYTHONIOENCODING": "utf-8"}
os.execve(sys.executable, [sys.executable, "-I", "-B", root + "/bootstrap.py", root + "/solution.py", root], env)
"#;

/// Container cleanup guard - guarantees container removal on drop
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
        }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Drop cannot be async; removal runs on the runtime in the background
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

pub struct DockerRunner {
    docker: Docker,
    image: String,
}

impl DockerRunner {
    pub fn connect(image: impl Into<String>) -> Result<Self, RunnerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            image: image.into(),
        })
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    async fn ensure_image(&self) -> Result<(), RunnerError> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            debug!(image = %self.image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %self.image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }

        info!(image = %self.image, "Image pulled");
        Ok(())
    }

    async fn run_container(&self, request: &RunRequest) -> Result<RunResponse, RunnerError> {
        let env = vec![
            encode_env("SOURCE_CODE", &request.code)?,
            encode_env("BOOTSTRAP", BOOTSTRAP_SOURCE)?,
            encode_env("TEST_INPUT", &request.stdin)?,
        ];

        self.ensure_image().await?;

        let memory = request
            .memory_limit_mb
            .map(|mb| (mb as i64).saturating_mul(1024 * 1024));

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "python3".to_string(),
                "-c".to_string(),
                LAUNCHER.to_string(),
            ]),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory,
                memory_swap: memory,
                nano_cpus: Some(NANO_CPUS),
                pids_limit: Some(PIDS_LIMIT),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let name = format!("verifier-{}", uuid::Uuid::new_v4());
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;
        let container_id = container.id;
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let started = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await?;

        // container start-up is covered by the compile budget
        let wall = (request.run_timeout.max(0.0) + request.compile_timeout.max(0.0)).min(MAX_WALL_SECS);
        let collect = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();

            let mut logs = self.docker.logs(
                &container_id,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    follow: true,
                    ..Default::default()
                }),
            );
            while let Some(output) = logs.next().await {
                match output {
                    Ok(LogOutput::StdOut { message }) => append_capped(&mut stdout, &message),
                    Ok(LogOutput::StdErr { message }) => append_capped(&mut stderr, &message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                }
            }

            let mut wait = self.docker.wait_container(
                &container_id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            // non-zero exits surface as DockerContainerWaitError
            let exit_code = match wait.next().await {
                Some(Ok(response)) => Some(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to get container exit code");
                    None
                }
                None => None,
            };

            (stdout, stderr, exit_code)
        };

        match tokio::time::timeout(Duration::from_secs_f64(wall), collect).await {
            Ok((stdout, stderr, exit_code)) => {
                let mut stderr = String::from_utf8_lossy(&stderr).into_owned();
                match exit_code {
                    Some(137) => stderr.push_str("\n[Container killed: likely OOM or exceeded memory limit]"),
                    Some(139) => stderr.push_str("\n[Container killed: segmentation fault]"),
                    _ => {}
                }
                debug!(
                    exit_code = ?exit_code,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Container finished"
                );

                let Some(code) = exit_code else {
                    return Ok(RunResponse::infra_error("No exit code captured from container"));
                };
                Ok(RunResponse {
                    status: RunStatus::Success,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr,
                    return_code: Some(code as i32),
                })
            }
            Err(_) => {
                debug!(container_id = %container_id, "Execution timed out, killing container");
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(error = %e, "Failed to kill timed-out container");
                }
                Ok(RunResponse::timeout())
            }
        }
    }
}

#[async_trait]
impl CodeRunner for DockerRunner {
    async fn execute(&self, request: &RunRequest) -> Result<RunResponse, RunnerError> {
        check_request_size(request)?;
        check_language(&request.language)?;

        if let Err(violation) = guard::scan(&request.code) {
            return Ok(RunResponse {
                status: RunStatus::Success,
                stdout: String::new(),
                stderr: format!("SecurityError: {}", violation),
                return_code: Some(1),
            });
        }

        self.run_container(request).await
    }
}

fn encode_env(name: &str, value: &str) -> Result<String, RunnerError> {
    let encoded = general_purpose::STANDARD.encode(value);
    if encoded.len() > MAX_ENV_VALUE_BYTES {
        return Err(RunnerError::RequestTooLarge(format!(
            "{} exceeds {} bytes once encoded",
            name, MAX_ENV_VALUE_BYTES
        )));
    }
    Ok(format!("{}={}", name, encoded))
}

fn append_capped(buf: &mut Vec<u8>, chunk: &[u8]) {
    let room = DEFAULT_OUTPUT_CAP.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}
