//! Supervision of running pod containers.
//!
//! The supervisor drives the agent from the moment every main container has
//! been spawned until the last one has exited. Cancellation is cooperative:
//! the supervisor never signals the containers itself and relies on the
//! surrounding job delivering signals to the container processes.

use anyhow::Context;
use anyhow::Result;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tokio::pin;
use tokio::select;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

/// Supervises the pod's main containers until they have all exited.
///
/// Receipt of `SIGINT` or `SIGTERM` cancels the token and drains; so does
/// `SIGCHLD`, which is the normal path when a container exits. Programmatic
/// cancellation of the token drains as well. Draining waits for every
/// supervisory task, so exit-code artifacts are always written for containers
/// that were started.
pub async fn supervise(shutdown: CancellationToken, handles: Vec<JoinHandle<()>>) -> Result<()> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to create SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to create SIGTERM handler")?;
    let mut child = signal(SignalKind::child()).context("failed to create SIGCHLD handler")?;

    info!("all containers have started; supervising until they exit");

    let drain = async {
        for handle in handles {
            handle.await.expect("failed to join task");
        }
    };
    pin!(drain);

    let mut draining = false;
    loop {
        select! {
            biased;

            _ = &mut drain => break,
            _ = shutdown.cancelled(), if !draining => {
                info!("cancellation requested: waiting for containers to exit");
                draining = true;
            }
            _ = interrupt.recv() => {
                info!("received SIGINT signal: waiting for containers to exit");
                shutdown.cancel();
                draining = true;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM signal: waiting for containers to exit");
                shutdown.cancel();
                draining = true;
            }
            _ = child.recv() => {
                debug!("received SIGCHLD signal: a container has terminated");
                shutdown.cancel();
                draining = true;
            }
        }
    }

    // The supervisory tasks reap the children they spawned; this collects
    // anything that was reparented onto the agent.
    reap_children();

    info!("all containers have exited");
    Ok(())
}

/// Reaps every child that is ready to be reaped, without blocking.
fn reap_children() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(pid) = status.pid() {
                    debug!("reaped child process {pid}");
                }
            }
            // ECHILD: nothing left to reap.
            Err(_) => break,
        }
    }
}
