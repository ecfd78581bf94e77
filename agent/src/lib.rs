//! Implements the perch pod execution agent.
//!
//! The agent runs inside an HPC batch-job allocation. It retrieves its pod
//! from the Kubernetes API, prepares the node environment, launches the pod's
//! containers with an unprivileged container runtime, and records container
//! state in the on-disk layout that the virtual kubelet observes.
//!
//! Init containers run strictly sequentially in spec order; main containers
//! run concurrently, one supervisory task per container. The agent exits once
//! every main container has exited, regardless of their exit codes.

use bon::Builder;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use perch_endpoint::Endpoint;
use tokio_util::sync::CancellationToken;

pub mod acquire;
mod environment;
pub mod image;
pub mod launcher;
pub mod prepare;
pub mod security;
pub mod status;
pub mod supervisor;

pub use environment::DEBUG_MODE_VARIABLE;
pub use environment::Environment;
pub use environment::KUBEDNS_IP_VARIABLE;

/// The pod annotation naming the root of the shared working directory.
pub const WORKING_DIRECTORY_ANNOTATION: &str = "workingDirectory";

/// Represents an agent error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The agent configuration was invalid.
    #[error("{0}")]
    Config(String),
    /// The pod could not be retrieved before the acquisition deadline.
    #[error("pod `{namespace}/{name}` was not retrievable before the deadline")]
    PodNotFound {
        /// The namespace of the pod.
        namespace: String,
        /// The name of the pod.
        name: String,
    },
    /// The pod environment could not be prepared.
    ///
    /// No containers have been launched.
    #[error("failed to prepare the pod environment")]
    Prep(#[source] anyhow::Error),
    /// An init container exited with a non-zero status.
    ///
    /// Remaining init containers and all main containers are not started.
    #[error("init container `{name}` exited with status {exit_code}")]
    InitFailed {
        /// The name of the init container.
        name: String,
        /// The recorded exit code.
        exit_code: i32,
    },
    /// A Kubernetes error occurred.
    #[error(transparent)]
    Kubernetes(#[from] kube::Error),
    /// A generic error occurred.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

/// The result type of the agent operations.
pub type AgentResult<T> = std::result::Result<T, Error>;

/// The pod execution agent.
#[derive(Builder)]
pub struct Agent {
    /// The name of the pod to execute.
    #[builder(into)]
    pod: String,

    /// The namespace of the pod to execute.
    #[builder(into)]
    namespace: String,

    /// The Kubernetes client used to retrieve the pod.
    client: Client,

    /// The ambient execution environment.
    environment: Environment,
}

impl Agent {
    /// Runs the pod to completion.
    ///
    /// Returns once every main container has exited and its exit-code
    /// artifact has been written. The exit codes of the main containers do
    /// not affect the result; they are recorded on disk for the virtual
    /// kubelet to observe.
    pub async fn run(self) -> AgentResult<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pod = acquire::wait_for_pod(&pods, &self.namespace, &self.pod).await?;

        let working_dir = pod
            .annotations()
            .get(WORKING_DIRECTORY_ANNOTATION)
            .ok_or_else(|| {
                Error::Config(format!(
                    "pod `{namespace}/{name}` is missing the `{WORKING_DIRECTORY_ANNOTATION}` \
                     annotation",
                    namespace = self.namespace,
                    name = self.pod,
                ))
            })?;

        let endpoint = Endpoint::new(working_dir);
        let pod_dir = endpoint.pod(&self.namespace, &self.pod);

        prepare::prepare_pod(&pod_dir, &self.namespace, &self.environment)
            .await
            .map_err(Error::Prep)?;

        let launcher = launcher::ContainerLauncher::new(
            self.environment,
            endpoint,
            pod_dir,
            self.namespace,
            self.pod,
        );

        launcher.run_init_containers(&pod).await?;

        let handles = launcher.spawn_main_containers(&pod);
        supervisor::supervise(CancellationToken::new(), handles).await?;
        Ok(())
    }
}
