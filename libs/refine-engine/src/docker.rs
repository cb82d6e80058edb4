//! Docker-backed execution engine.
//!
//! **Container Rules:**
//! 1. Image pulled once at startup if missing
//! 2. One container per run, created fresh and force-removed afterwards
//! 3. Network disabled, memory/CPU/pid limits enforced
//! 4. Files and stdin injected as base64 environment variables
//! 5. Hard timeout; container killed on expiry

use crate::engine::{ExecutionEngine, ProgramRun, RawExecution};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use refine_common::config::{ConfigError, RuntimeConfig};
use std::time::Instant;
use tracing::{debug, info, warn};

const WORKDIR: &str = "/sandbox";
const PIDS_LIMIT: i64 = 64;

/// Container cleanup guard - guarantees container removal on drop,
/// including when the run future is cancelled mid-flight.
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

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

pub struct DockerEngine {
    docker: Docker,
    image: String,
    memory_limit_bytes: i64,
    nano_cpus: i64,
}

impl DockerEngine {
    /// Connect to the local daemon and make sure the runtime image is present
    pub async fn connect(runtime: &RuntimeConfig) -> Result<Self, ConfigError> {
        let unavailable = |e: &dyn std::fmt::Display| {
            ConfigError::RuntimeUnavailable(format!("docker: {}", e))
        };

        let docker = Docker::connect_with_local_defaults().map_err(|e| unavailable(&e))?;
        docker.ping().await.map_err(|e| unavailable(&e))?;

        let engine = Self {
            docker,
            image: runtime.image.clone(),
            memory_limit_bytes: i64::from(runtime.memory_limit_mb) * 1024 * 1024,
            nano_cpus: (f64::from(runtime.cpu_limit) * 1_000_000_000.0) as i64,
        };
        engine
            .ensure_image()
            .await
            .map_err(|e| unavailable(&format!("{:#}", e)))?;
        Ok(engine)
    }

    async fn ensure_image(&self) -> Result<()> {
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
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }
        info!(image = %self.image, "Image pulled");
        Ok(())
    }
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Shell script that materializes the files from env vars and execs argv
fn bootstrap_script(program: &ProgramRun) -> String {
    let mut script = format!("mkdir -p {dir} && cd {dir}", dir = WORKDIR);
    for (i, (name, _)) in program.files.iter().enumerate() {
        script.push_str(&format!(
            " && printf '%s' \"$FILE_{}\" | base64 -d > {}",
            i,
            shell_quote(name)
        ));
    }
    let argv: Vec<String> = program.argv.iter().map(|a| shell_quote(a)).collect();
    script.push_str(&format!(
        " && printf '%s' \"$STDIN_DATA\" | base64 -d > /tmp/stdin && exec {} < /tmp/stdin",
        argv.join(" ")
    ));
    script
}

#[async_trait]
impl ExecutionEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[tracing::instrument(skip(self, program), fields(image = %self.image))]
    async fn run(&self, program: &ProgramRun) -> Result<RawExecution> {
        let container_name = format!("refine-{}", uuid::Uuid::new_v4());

        let mut env: Vec<String> = program
            .files
            .iter()
            .enumerate()
            .map(|(i, (_, contents))| {
                format!("FILE_{}={}", i, general_purpose::STANDARD.encode(contents))
            })
            .collect();
        env.push(format!(
            "STDIN_DATA={}",
            general_purpose::STANDARD.encode(&program.stdin)
        ));

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), bootstrap_script(program)]),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(self.memory_limit_bytes),
                nano_cpus: Some(self.nano_cpus),
                pids_limit: Some(PIDS_LIMIT),
                readonly_rootfs: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create Docker container")?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let execution = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            let mut exit_code: Option<i64> = None;

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });
            let mut logs = self.docker.logs(&container_id, logs_options);
            while let Some(output) = logs.next().await {
                match output {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                    _ => {}
                }
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait = self.docker.wait_container(&container_id, Some(wait_options));
            match wait.next().await {
                Some(Ok(response)) => exit_code = Some(response.status_code),
                // Non-zero exits surface as an error carrying the code
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    exit_code = Some(code)
                }
                Some(Err(e)) => warn!(error = %e, "Failed to get container exit code"),
                None => warn!("No wait response from container"),
            }

            (stdout, stderr, exit_code)
        };

        let mut timed_out = false;
        let mut runtime_error = false;

        let (stdout, stderr, exit_code) =
            match tokio::time::timeout(program.timeout, execution).await {
                Ok((out, mut err, code)) => {
                    if let Some(code) = code {
                        if code != 0 {
                            runtime_error = true;
                            if code == 137 {
                                err.push_str("\n[Container killed: likely OOM or exceeded memory limit]");
                            } else if code == 139 {
                                err.push_str("\n[Container killed: segmentation fault]");
                            }
                        }
                    } else {
                        runtime_error = true;
                        err.push_str("\n[No exit code captured from container]");
                    }
                    (out, err, code)
                }
                Err(_) => {
                    timed_out = true;
                    debug!(timeout_ms = program.timeout.as_millis() as u64, "Run timed out, killing container");
                    if let Err(e) = self
                        .docker
                        .kill_container(&container_id, None::<KillContainerOptions<String>>)
                        .await
                    {
                        warn!(error = %e, "Failed to kill timed-out container");
                    }
                    (String::new(), String::from("\n[Execution timed out]"), None)
                }
            };

        Ok(RawExecution {
            stdout,
            stderr,
            exit_code,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
            timed_out,
            runtime_error,
        })
    }
}
