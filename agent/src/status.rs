//! On-disk status artifacts observed by the virtual kubelet.
//!
//! Each artifact is written at most once per run; observers may see files
//! appear but never disappear while the agent is alive. The files are left in
//! place at agent exit for post-mortem inspection.

use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;

use anyhow::Context;
use anyhow::Result;
use perch_endpoint::ContainerDirectory;
use tokio::io::AsyncWriteExt;

/// The permissions applied to status artifact files.
const ARTIFACT_MODE: u32 = 0o644;

/// Writes the container's process id artifact.
pub async fn write_container_id(dir: &ContainerDirectory, pid: u32) -> Result<()> {
    write_artifact(&dir.id_path(), &format!("pid://{pid}")).await
}

/// Writes the container's exit status artifact.
pub async fn write_exit_code(dir: &ContainerDirectory, code: i32) -> Result<()> {
    write_artifact(&dir.exit_code_path(), &code.to_string()).await
}

/// Creates the container's log file, truncating any previous contents.
///
/// The returned handle receives the combined stdout and stderr of the
/// container.
pub fn create_log_file(dir: &ContainerDirectory) -> Result<File> {
    File::create(dir.logs_path()).with_context(|| {
        format!(
            "failed to create log file `{path}`",
            path = dir.logs_path().display()
        )
    })
}

/// Maps an exit status to a numeric exit code in `[0, 255]`.
///
/// Signal deaths map to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Writes a status artifact with the artifact permissions.
async fn write_artifact(path: &Path, contents: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(ARTIFACT_MODE)
        .open(path)
        .await
        .with_context(|| format!("failed to create `{path}`", path = path.display()))?;

    file.write_all(contents.as_bytes())
        .await
        .with_context(|| format!("failed to write `{path}`", path = path.display()))?;

    Ok(())
}
