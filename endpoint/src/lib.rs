//! Canonical on-disk layout for pods executed on a compute node.
//!
//! The agent and the virtual kubelet communicate exclusively through files
//! placed under a shared working directory:
//!
//! ```text
//! <workingDirectory>/<namespace>/<podName>/
//!     .ip                          space-separated IPv4 addresses of the node
//!     volumes/<volumeName>/        materialized volumes
//!     <containerName>/
//!         .env                     optional environment script
//!         .id                      "pid://<n>", written after spawn
//!         .exitCode                decimal exit status, written after reaping
//!         .logs                    combined stdout and stderr
//! <workingDirectory>/images/       container image artifacts
//! ```
//!
//! The path strings produced here are a compatibility boundary: the virtual
//! kubelet polls these exact locations to observe container state. Everything
//! in this crate is a pure function of its inputs and performs no I/O.

use std::path::Path;
use std::path::PathBuf;

/// The name of the file holding the node's IPv4 addresses.
const IP_ADDRESS_FILE: &str = ".ip";

/// The name of the directory holding materialized pod volumes.
const VOLUMES_DIR: &str = "volumes";

/// The name of the directory holding container image artifacts.
const IMAGES_DIR: &str = "images";

/// The name of a container's optional environment script.
const ENV_FILE: &str = ".env";

/// The name of the file holding a container's process id.
const ID_FILE: &str = ".id";

/// The name of the file holding a container's exit status.
const EXIT_CODE_FILE: &str = ".exitCode";

/// The name of the file holding a container's combined output.
const LOGS_FILE: &str = ".logs";

/// Formats the stable per-container instance name.
///
/// The instance name is used for scratch file names and must be distinct for
/// any two containers of the same pod.
pub fn instance_name(namespace: &str, pod_name: &str, container_name: &str) -> String {
    format!("{namespace}_{pod_name}_{container_name}")
}

/// The root of the shared working directory.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// The working directory under which the per-pod layout is built.
    root: PathBuf,
}

impl Endpoint {
    /// Constructs an endpoint rooted at the given working directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Gets the root working directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Gets the directory holding container image artifacts.
    pub fn image_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    /// Gets the directory of the given pod.
    pub fn pod(&self, namespace: &str, name: &str) -> PodDirectory {
        PodDirectory {
            path: self.root.join(namespace).join(name),
        }
    }
}

/// The directory holding a single pod's artifacts.
#[derive(Debug, Clone)]
pub struct PodDirectory {
    /// The path of the pod directory.
    path: PathBuf,
}

impl PodDirectory {
    /// Gets the path of the pod directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gets the directory holding the pod's materialized volumes.
    pub fn volume_dir(&self) -> PathBuf {
        self.path.join(VOLUMES_DIR)
    }

    /// Gets the path of the pod's IP address file.
    pub fn ip_address_path(&self) -> PathBuf {
        self.path.join(IP_ADDRESS_FILE)
    }

    /// Gets the directory of the given container.
    pub fn container(&self, name: &str) -> ContainerDirectory {
        ContainerDirectory {
            path: self.path.join(name),
        }
    }
}

/// The directory holding a single container's artifacts.
#[derive(Debug, Clone)]
pub struct ContainerDirectory {
    /// The path of the container directory.
    path: PathBuf,
}

impl ContainerDirectory {
    /// Gets the path of the container directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gets the path of the container's optional environment script.
    pub fn env_file_path(&self) -> PathBuf {
        self.path.join(ENV_FILE)
    }

    /// Gets the path of the container's process id file.
    pub fn id_path(&self) -> PathBuf {
        self.path.join(ID_FILE)
    }

    /// Gets the path of the container's exit status file.
    pub fn exit_code_path(&self) -> PathBuf {
        self.path.join(EXIT_CODE_FILE)
    }

    /// Gets the path of the container's combined output file.
    pub fn logs_path(&self) -> PathBuf {
        self.path.join(LOGS_FILE)
    }
}
