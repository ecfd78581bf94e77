//! Pod acquisition from the Kubernetes API.
//!
//! The pod object may not yet be visible when the batch job starts, so the
//! agent polls until the pod is retrievable or an overall deadline elapses.

use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tokio::pin;
use tokio::select;
use tokio::time::Instant;
use tokio::time::sleep;
use tokio::time::sleep_until;
use tokio::time::timeout;
use tracing::info;
use tracing::warn;

use crate::AgentResult;
use crate::Error;

/// The interval between pod retrieval attempts.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The overall deadline for the pod to become retrievable.
const ACQUIRE_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// The timeout applied to each retrieval request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls the API until the pod is retrievable.
///
/// Every retrieval error is retried until the deadline elapses; the API does
/// not let the agent distinguish a pod that does not exist yet from a
/// transient failure. After the polling loop, one additional fetch produces
/// the authoritative snapshot used for launching.
pub async fn wait_for_pod(pods: &Api<Pod>, namespace: &str, name: &str) -> AgentResult<Pod> {
    let deadline = sleep_until(Instant::now() + ACQUIRE_DEADLINE);
    pin!(deadline);

    loop {
        select! {
            biased;

            _ = &mut deadline => {
                return Err(Error::PodNotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            }
            result = get_pod(pods, name) => match result {
                Ok(_) => break,
                Err(e) => {
                    warn!("failed to retrieve pod `{namespace}/{name}`: {e:#}: retrying");
                    sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    // The authoritative snapshot used for launching.
    let pod = timeout(REQUEST_TIMEOUT, pods.get(name))
        .await
        .context("timed out retrieving the pod")??;

    info!("pod `{namespace}/{name}` has been acquired");
    Ok(pod)
}

/// Retrieves the pod with a bounded request timeout.
async fn get_pod(pods: &Api<Pod>, name: &str) -> Result<Pod> {
    timeout(REQUEST_TIMEOUT, pods.get(name))
        .await
        .context("timed out retrieving the pod")?
        .context("the API server returned an error")
}
