//! Launches pod containers with the unprivileged container runtime.
//!
//! Init and main containers share the same per-container procedure: evaluate
//! the optional environment script, construct the runtime invocation, spawn
//! with output redirected to the log artifact, record the process id, wait,
//! and record the exit status. They differ only in scheduling: init
//! containers run synchronously in spec order, while each main container is
//! driven by its own supervisory task.

use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use perch_endpoint::ContainerDirectory;
use perch_endpoint::Endpoint;
use perch_endpoint::PodDirectory;
use perch_endpoint::instance_name;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::AgentResult;
use crate::Environment;
use crate::Error;
use crate::image;
use crate::security;
use crate::security::RunAs;
use crate::status;

/// Launches the containers of a single pod.
#[derive(Debug, Clone)]
pub struct ContainerLauncher {
    /// The ambient execution environment.
    environment: Environment,
    /// The endpoint rooted at the pod's working directory.
    endpoint: Endpoint,
    /// The pod's directory within the endpoint.
    pod_dir: PodDirectory,
    /// The namespace of the pod.
    namespace: String,
    /// The name of the pod.
    pod_name: String,
}

/// A fully constructed runtime invocation for one container.
#[derive(Debug)]
struct Invocation {
    /// The name of the container.
    name: String,
    /// The argument vector passed to the container runtime.
    args: Vec<String>,
    /// The directory receiving the container's status artifacts.
    container_dir: ContainerDirectory,
}

impl ContainerLauncher {
    /// Constructs a launcher for the given pod.
    pub fn new(
        environment: Environment,
        endpoint: Endpoint,
        pod_dir: PodDirectory,
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
    ) -> Self {
        Self {
            environment,
            endpoint,
            pod_dir,
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }

    /// Runs the pod's init containers sequentially in spec order.
    ///
    /// Each init container fully completes, including its exit-code artifact,
    /// before the next one starts. A non-zero exit aborts the pod: remaining
    /// init containers and all main containers are not started.
    pub async fn run_init_containers(&self, pod: &Pod) -> AgentResult<()> {
        let init_containers = pod
            .spec
            .as_ref()
            .and_then(|s| s.init_containers.as_deref())
            .unwrap_or_default();

        for container in init_containers {
            let run_as = security::effective_run_as(pod, container);

            info!("spawning init container `{name}`", name = container.name);
            let invocation = self
                .prepare_invocation(container, run_as)
                .await
                .with_context(|| {
                    format!(
                        "failed to prepare init container `{name}`",
                        name = container.name
                    )
                })?;

            let status = self.execute(&invocation).await.with_context(|| {
                format!(
                    "failed to execute init container `{name}`",
                    name = container.name
                )
            })?;

            if !status.success() {
                return Err(Error::InitFailed {
                    name: container.name.clone(),
                    exit_code: status::exit_code(status),
                });
            }
        }

        Ok(())
    }

    /// Spawns one supervisory task per main container.
    ///
    /// Returns as soon as every task has been spawned; joining them is the
    /// supervisor's concern.
    pub fn spawn_main_containers(&self, pod: &Pod) -> Vec<JoinHandle<()>> {
        let containers = pod
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default();

        let mut handles = Vec::with_capacity(containers.len());
        for container in containers {
            let run_as = security::effective_run_as(pod, container);
            let launcher = self.clone();
            let container = container.clone();

            handles.push(tokio::spawn(async move {
                launcher.supervise_container(container, run_as).await;
            }));
        }

        handles
    }

    /// Drives one main container from spawn to exit-code artifact.
    ///
    /// Faults are contained here so that one container cannot prevent its
    /// siblings from completing.
    async fn supervise_container(self, container: Container, run_as: RunAs) {
        let name = &container.name;

        let invocation = match self.prepare_invocation(&container, run_as).await {
            Ok(invocation) => invocation,
            Err(e) => {
                error!("failed to prepare container `{name}`: {e:#}");
                return;
            }
        };

        info!("spawning main container `{name}`");
        match self.execute(&invocation).await {
            Ok(status) if status.success() => {
                info!("container `{name}` has completed");
            }
            Ok(status) => {
                error!("container `{name}` exited abnormally with {status}");
            }
            Err(e) => {
                error!("failed to execute container `{name}`: {e:#}");
            }
        }
    }

    /// Runs the shared per-container procedure: spawn the runtime with output
    /// redirected to the log artifact, record the process id, wait, and
    /// record the exit status.
    async fn execute(&self, invocation: &Invocation) -> Result<ExitStatus> {
        let log = status::create_log_file(&invocation.container_dir)?;
        let stdout = log.try_clone().context("failed to clone log file handle")?;

        debug!(
            "runtime arguments for container `{name}`: {args:?}",
            name = invocation.name,
            args = invocation.args,
        );

        let mut child = Command::new(self.environment.runtime())
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(log))
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn the container runtime `{runtime}`",
                    runtime = self.environment.runtime()
                )
            })?;

        let pid = child
            .id()
            .context("the container runtime has no process id")?;
        status::write_container_id(&invocation.container_dir, pid).await?;

        let status = child.wait().await.with_context(|| {
            format!(
                "failed to wait for container `{name}`",
                name = invocation.name
            )
        })?;
        status::write_exit_code(&invocation.container_dir, status::exit_code(status)).await?;

        Ok(status)
    }

    /// Builds the runtime invocation for a container.
    async fn prepare_invocation(&self, container: &Container, run_as: RunAs) -> Result<Invocation> {
        let instance = instance_name(&self.namespace, &self.pod_name, &container.name);
        let container_dir = self.pod_dir.container(&container.name);

        let env_file = self.evaluate_env_file(&container_dir, &instance).await?;

        let image_path = self
            .endpoint
            .image_dir()
            .join(image::resolve(container.image.as_deref().unwrap_or_default())?);

        let binds = volume_binds(&self.pod_dir, container);
        let args = build_runtime_args(
            &self.environment,
            run_as,
            &binds,
            env_file.as_deref(),
            &image_path,
            container.command.as_deref().unwrap_or_default(),
            container.args.as_deref().unwrap_or_default(),
        );

        Ok(Invocation {
            name: container.name.clone(),
            args,
            container_dir,
        })
    }

    /// Evaluates the container's environment script, if present.
    ///
    /// The script is expected to print `KEY=VALUE` lines; its combined output
    /// becomes the runtime's `--env-file`.
    async fn evaluate_env_file(
        &self,
        container_dir: &ContainerDirectory,
        instance: &str,
    ) -> Result<Option<PathBuf>> {
        let script = container_dir.env_file_path();
        if !script.is_file() {
            return Ok(None);
        }

        let output = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .output()
            .await
            .with_context(|| {
                format!(
                    "failed to run environment script `{path}`",
                    path = script.display()
                )
            })?;

        if !output.status.success() {
            bail!(
                "environment script `{path}` failed with {status}",
                path = script.display(),
                status = output.status,
            );
        }

        let mut contents = output.stdout;
        contents.extend_from_slice(&output.stderr);

        let path = self.environment.instance_env_path(instance);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&path)
            .await
            .with_context(|| format!("failed to create `{path}`", path = path.display()))?;
        file.write_all(&contents)
            .await
            .with_context(|| format!("failed to write `{path}`", path = path.display()))?;

        Ok(Some(path))
    }
}

/// Formats the bind list for a container's volume mounts.
///
/// Volumes are materialized by the virtual kubelet under the pod's volume
/// directory before the job is submitted.
fn volume_binds(pod_dir: &PodDirectory, container: &Container) -> Vec<String> {
    container
        .volume_mounts
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|mount| {
            let host_path = pod_dir.volume_dir().join(&mount.name);
            let access = if mount.read_only.unwrap_or(false) {
                "ro"
            } else {
                "rw"
            };
            format!(
                "{host}:{container}:{access}",
                host = host_path.display(),
                container = mount.mount_path,
            )
        })
        .collect()
}

/// Builds the full runtime argument vector for a container.
///
/// The synthesized resolver files and the volume binds share a single
/// `--bind` argument; the container command and its arguments trail the image
/// artifact path.
fn build_runtime_args(
    environment: &Environment,
    run_as: RunAs,
    binds: &[String],
    env_file: Option<&Path>,
    image: &Path,
    command: &[String],
    arguments: &[String],
) -> Vec<String> {
    let verbosity = if environment.debug() {
        "--debug"
    } else {
        "--quiet"
    };
    let mode = if command.is_empty() { "run" } else { "exec" };

    let mut args = vec![
        verbosity.to_string(),
        mode.to_string(),
        "--cleanenv".to_string(),
        "--writable-tmpfs".to_string(),
        "--no-mount".to_string(),
        "home".to_string(),
        "--unsquash".to_string(),
    ];

    let mut bind = format!(
        "{resolv}:/etc/resolv.conf,{hosts}:/etc/hosts",
        resolv = environment.resolv_conf_path().display(),
        hosts = environment.hosts_path().display(),
    );
    for b in binds {
        bind.push(',');
        bind.push_str(b);
    }
    args.push("--bind".to_string());
    args.push(bind);

    if run_as.uid != 0 {
        args.push("--security".to_string());
        args.push(format!("uid:{uid},gid:{uid}", uid = run_as.uid));
        args.push("--userns".to_string());
    }
    if run_as.gid != 0 {
        args.push("--security".to_string());
        args.push(format!("gid:{gid}", gid = run_as.gid));
        args.push("--userns".to_string());
    }

    if let Some(env_file) = env_file {
        args.push("--env-file".to_string());
        args.push(env_file.display().to_string());
    }

    args.push(image.display().to_string());
    args.extend(command.iter().cloned());
    args.extend(arguments.iter().cloned());
    args
}
