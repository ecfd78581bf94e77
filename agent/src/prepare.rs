//! Pod environment preparation.
//!
//! Preparation runs once, strictly before any container is launched: the
//! resolver files are synthesized under the scratch directory, the node's
//! addresses are announced to the virtual kubelet, and variables leaked by
//! the enclosing container are scrubbed from the process environment.

use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;

use anyhow::Context;
use anyhow::Result;
use perch_endpoint::PodDirectory;
use tracing::debug;

use crate::Environment;

/// The permissions applied to the synthesized `etc` directory.
const ETC_DIR_MODE: u32 = 0o755;

/// Environment variables leaked by an enclosing unprivileged container.
///
/// The agent itself runs inside such a container; if left set, these
/// variables are consumed by the nested runtime invocation and overwrite its
/// paths.
pub const SCRUBBED_VARIABLES: [&str; 12] = [
    "LD_LIBRARY_PATH",
    "SINGULARITY_COMMAND",
    "SINGULARITY_CONTAINER",
    "SINGULARITY_ENVIRONMENT",
    "SINGULARITY_NAME",
    "APPTAINER_APPNAME",
    "APPTAINER_COMMAND",
    "APPTAINER_CONTAINER",
    "APPTAINER_ENVIRONMENT",
    "APPTAINER_NAME",
    "APPTAINER_BIND",
    "SINGULARITY_BIND",
];

/// Prepares the node for launching the pod's containers.
///
/// The steps are ordered; any failure aborts the pod before anything is
/// launched.
pub async fn prepare_pod(
    pod_dir: &PodDirectory,
    namespace: &str,
    environment: &Environment,
) -> Result<()> {
    prepare_dns(namespace, environment).await?;
    announce_ip(pod_dir).await?;
    scrub_environment();
    Ok(())
}

/// Synthesizes `resolv.conf` and `hosts` under the scratch directory.
///
/// The files are bind-mounted into every container so that cluster DNS and
/// the node's own hostname resolve inside them.
async fn prepare_dns(namespace: &str, environment: &Environment) -> Result<()> {
    let etc = environment.etc_dir();
    tokio::fs::create_dir_all(&etc)
        .await
        .with_context(|| format!("failed to create `{path}`", path = etc.display()))?;
    tokio::fs::set_permissions(&etc, std::fs::Permissions::from_mode(ETC_DIR_MODE))
        .await
        .with_context(|| format!("failed to set permissions on `{path}`", path = etc.display()))?;

    let resolv_conf = format!(
        "search {namespace}.svc.cluster.local svc.cluster.local cluster.local\n\
         nameserver {ip}\n\
         options ndots:5\n",
        ip = environment.dns_ip(),
    );
    tokio::fs::write(environment.resolv_conf_path(), &resolv_conf)
        .await
        .context("failed to write resolv.conf")?;

    let hostname = hostname::get().context("failed to get the node hostname")?;
    let addresses = node_ipv4_addresses()?;
    let hosts = format!(
        "127.0.0.1 localhost\n{addresses} {hostname}\n",
        addresses = addresses.join(" "),
        hostname = hostname.to_string_lossy(),
    );
    tokio::fs::write(environment.hosts_path(), &hosts)
        .await
        .context("failed to write hosts")?;

    debug!("synthesized resolv.conf:\n{resolv_conf}");
    debug!("synthesized hosts:\n{hosts}");
    Ok(())
}

/// Writes the node's IPv4 addresses to the pod's IP artifact.
///
/// The file is written once and never mutated afterwards.
async fn announce_ip(pod_dir: &PodDirectory) -> Result<()> {
    let addresses = node_ipv4_addresses()?;
    let path = pod_dir.ip_address_path();
    tokio::fs::write(&path, addresses.join(" "))
        .await
        .with_context(|| format!("failed to write `{path}`", path = path.display()))
}

/// Enumerates the node's non-loopback IPv4 addresses.
fn node_ipv4_addresses() -> Result<Vec<String>> {
    let interfaces = if_addrs::get_if_addrs().context("failed to enumerate network interfaces")?;

    Ok(interfaces
        .into_iter()
        .filter(|interface| !interface.is_loopback())
        .filter_map(|interface| match interface.ip() {
            IpAddr::V4(ip) => Some(ip.to_string()),
            IpAddr::V6(_) => None,
        })
        .collect())
}

/// Removes nested-container variables from the process environment.
///
/// This is the single process-wide effect of preparation; children inherit
/// the agent's environment, so it must complete before any child is spawned.
fn scrub_environment() {
    for name in SCRUBBED_VARIABLES {
        // SAFETY: preparation completes before any container task is spawned
        // and nothing else mutates the process environment concurrently.
        unsafe { std::env::remove_var(name) };
    }
}
