//! Runs one stage's container to completion and classifies its outcome.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use futures::StreamExt;
use sdcloud_core::{Error, Result, StageOutcome};
use tracing::{debug, info, warn};

/// Memory ceiling applied to every stage container.
pub const MEMORY_CEILING_BYTES: i64 = 16 * 1024 * 1024 * 1024;

/// How long the runner waits for a line of log output before treating the
/// container as hung and force-removing it.
pub const LOG_READ_TIMEOUT: Duration = Duration::from_secs(60 * 30);

/// Everything needed to run a single stage invocation.
pub struct ContainerSpec {
    pub task_function: String,
    pub task_id: String,
    pub image: String,
    /// Already-interpolated shell command (no further `{name}` substitution).
    pub command: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// A second bind of `output_dir` at a legacy path some stage containers
    /// still look for.
    pub output_alias_path: String,
    pub gpu: bool,
}

impl ContainerSpec {
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.task_function, self.task_id)
    }
}

#[async_trait]
pub trait ContainerRunner: Send + Sync {
    async fn run_container(&self, spec: &ContainerSpec) -> Result<StageOutcome>;

    /// Force-remove a running container by name. Used when a task is
    /// revoked while its container is still executing; a no-op if the
    /// container is already gone.
    async fn kill_container(&self, container_name: &str) -> Result<()>;
}

/// Runs stage containers against a local Docker daemon via `bollard`.
pub struct DockerContainerRunner {
    docker: Docker,
}

impl DockerContainerRunner {
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Internal(format!("connecting to docker: {e}")))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Wraps the interpolated command in a shell that traps errors and
    /// interrupts and emits the `ExitCodeError` sentinel the log-text
    /// classifier looks for, so a non-zero exit is visible in captured logs
    /// even when the caller never inspects the container's real exit code.
    fn wrapped_command(user_command: &str) -> Vec<String> {
        let script = format!(
            "trap 'echo ExitCodeError' ERR INT\nset -ex\n{user_command}\n"
        );
        vec!["/bin/sh".to_string(), "-c".to_string(), script]
    }
}

#[async_trait]
impl ContainerRunner for DockerContainerRunner {
    async fn run_container(&self, spec: &ContainerSpec) -> Result<StageOutcome> {
        let name = spec.container_name();

        info!(image = %spec.image, container = %name, "pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: spec.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(result) = pull.next().await {
            if let Err(e) = result {
                warn!(error = %e, "pull warning");
            }
        }

        let binds = vec![
            format!("{}:/workdir/input:rw", spec.input_dir.display()),
            format!("{}:/workdir/output:rw", spec.output_dir.display()),
            format!("{}:{}:rw", spec.output_dir.display(), spec.output_alias_path),
        ];

        let device_requests = spec.gpu.then(|| {
            vec![DeviceRequest {
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let host_config = HostConfig {
            binds: Some(binds),
            memory: Some(MEMORY_CEILING_BYTES),
            device_requests,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(Self::wrapped_command(&spec.command)),
            env: Some(vec!["OPENCV_IO_ENABLE_OPENEXR=1".to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| Error::StageFailed(format!("creating container {name}: {e}")))?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::StageFailed(format!("starting container {name}: {e}")))?;

        self.wait_container(&name).await
    }

    async fn kill_container(&self, container_name: &str) -> Result<()> {
        self.force_remove(container_name).await;
        Ok(())
    }
}

impl DockerContainerRunner {
    async fn force_remove(&self, container_name: &str) {
        let _ = self
            .docker
            .remove_container(
                container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }

    /// Streams the container's combined log output, applying a read timeout
    /// per line. Returns the classified [`StageOutcome`]; a timed-out
    /// container is force-removed before returning.
    pub async fn wait_container(&self, container_name: &str) -> Result<StageOutcome> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_name, Some(options));
        let mut log = String::new();
        let mut timed_out = false;

        loop {
            match tokio::time::timeout(LOG_READ_TIMEOUT, stream.next()).await {
                Ok(Some(Ok(output))) => {
                    let chunk = match output {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => String::from_utf8_lossy(&message).into_owned(),
                    };
                    log.push_str(&chunk);
                }
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "log stream error, treating as end of stream");
                    break;
                }
                Ok(None) => break,
                Err(_elapsed) => {
                    warn!(container = %container_name, "timed out waiting for log output");
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            self.force_remove(container_name).await;
        }

        Ok(StageOutcome::classify(&log, timed_out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_deterministic() {
        let spec = ContainerSpec {
            task_function: "stage_2".into(),
            task_id: "abc123".into(),
            image: "example/image:stable".into(),
            command: "run".into(),
            input_dir: PathBuf::from("/tmp/input"),
            output_dir: PathBuf::from("/tmp/output"),
            output_alias_path: "/workdir/blender_workdir/job/output".into(),
            gpu: true,
        };
        assert_eq!(spec.container_name(), "stage_2-abc123");
    }

    #[test]
    fn wrapped_command_sets_trap_and_errexit() {
        let wrapped = DockerContainerRunner::wrapped_command("python stage.py");
        assert_eq!(wrapped[0], "/bin/sh");
        assert_eq!(wrapped[1], "-c");
        assert!(wrapped[2].contains("trap 'echo ExitCodeError' ERR INT"));
        assert!(wrapped[2].contains("set -ex"));
        assert!(wrapped[2].contains("python stage.py"));
    }
}
