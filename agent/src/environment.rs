//! The ambient execution environment of the agent.

use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;

use bon::Builder;

use crate::Error;

/// The name of the environment variable holding the cluster DNS resolver IP.
pub const KUBEDNS_IP_VARIABLE: &str = "KUBEDNS_IP";

/// The name of the environment variable enabling verbose runtime logging.
pub const DEBUG_MODE_VARIABLE: &str = "DEBUG_MODE";

/// The default job-local scratch directory.
const DEFAULT_SCRATCH_DIR: &str = "/scratch";

/// The default unprivileged container runtime program.
const DEFAULT_RUNTIME: &str = "apptainer";

/// The name of the scratch subdirectory holding synthesized resolver files.
const ETC_DIR: &str = "etc";

/// The ambient execution environment of the agent.
///
/// The environment is an explicit value threaded through preparation and the
/// launcher; the agent assumes exclusive ownership of the scratch directory
/// for its lifetime.
#[derive(Debug, Clone, Builder)]
pub struct Environment {
    /// The job-local scratch directory.
    #[builder(into, default = PathBuf::from(DEFAULT_SCRATCH_DIR))]
    scratch: PathBuf,

    /// The cluster DNS resolver IP.
    dns_ip: IpAddr,

    /// Whether verbose runtime logging is enabled.
    #[builder(default)]
    debug: bool,

    /// The unprivileged container runtime program.
    #[builder(into, default = String::from(DEFAULT_RUNTIME))]
    runtime: String,
}

impl Environment {
    /// Constructs the environment from the process environment.
    ///
    /// Returns an error if `KUBEDNS_IP` is not set or is not an IP address.
    pub fn from_env() -> Result<Self, Error> {
        let ip = std::env::var(KUBEDNS_IP_VARIABLE).map_err(|_| {
            Error::Config(format!(
                "the `{KUBEDNS_IP_VARIABLE}` environment variable is not set"
            ))
        })?;

        let dns_ip = ip.parse().map_err(|_| {
            Error::Config(format!(
                "invalid value `{ip}` for the `{KUBEDNS_IP_VARIABLE}` environment variable"
            ))
        })?;

        let debug = std::env::var(DEBUG_MODE_VARIABLE).is_ok_and(|v| v == "true");

        Ok(Self::builder().dns_ip(dns_ip).debug(debug).build())
    }

    /// Gets the scratch directory.
    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Gets the directory holding the synthesized resolver files.
    pub fn etc_dir(&self) -> PathBuf {
        self.scratch.join(ETC_DIR)
    }

    /// Gets the path of the synthesized `resolv.conf`.
    pub fn resolv_conf_path(&self) -> PathBuf {
        self.etc_dir().join("resolv.conf")
    }

    /// Gets the path of the synthesized `hosts` file.
    pub fn hosts_path(&self) -> PathBuf {
        self.etc_dir().join("hosts")
    }

    /// Gets the path of a container instance's evaluated environment file.
    pub fn instance_env_path(&self, instance: &str) -> PathBuf {
        self.scratch.join(format!("{instance}.env"))
    }

    /// Gets the cluster DNS resolver IP.
    pub fn dns_ip(&self) -> IpAddr {
        self.dns_ip
    }

    /// Whether verbose runtime logging is enabled.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Gets the unprivileged container runtime program.
    pub fn runtime(&self) -> &str {
        &self.runtime
    }
}
