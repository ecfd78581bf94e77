//! Effective security context resolution.

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;

/// The effective user and group identity of a container.
///
/// A zero value means no override is passed to the container runtime and the
/// container inherits the caller's identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunAs {
    /// The effective user id.
    pub uid: i64,
    /// The effective group id.
    pub gid: i64,
}

/// Determines the effective identity for a container.
///
/// Container-level security context settings take precedence over pod-level
/// settings.
pub fn effective_run_as(pod: &Pod, container: &Container) -> RunAs {
    let pod_context = pod.spec.as_ref().and_then(|s| s.security_context.as_ref());
    let container_context = container.security_context.as_ref();

    let uid = container_context
        .and_then(|c| c.run_as_user)
        .or_else(|| pod_context.and_then(|c| c.run_as_user))
        .unwrap_or(0);

    let gid = container_context
        .and_then(|c| c.run_as_group)
        .or_else(|| pod_context.and_then(|c| c.run_as_group))
        .unwrap_or(0);

    RunAs { uid, gid }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodSecurityContext;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::SecurityContext;

    use super::*;

    /// Builds a pod with the given pod-level security context.
    fn pod(context: Option<PodSecurityContext>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                security_context: context,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn absent_contexts_yield_no_overrides() {
        let run_as = effective_run_as(&pod(None), &Container::default());
        assert_eq!(run_as, RunAs::default());
    }

    #[test]
    fn pod_level_settings_apply_when_container_is_silent() {
        let pod = pod(Some(PodSecurityContext {
            run_as_user: Some(1000),
            run_as_group: Some(2000),
            ..Default::default()
        }));

        let run_as = effective_run_as(&pod, &Container::default());
        assert_eq!(run_as, RunAs { uid: 1000, gid: 2000 });
    }

    #[test]
    fn container_level_settings_take_precedence() {
        let pod = pod(Some(PodSecurityContext {
            run_as_user: Some(1000),
            run_as_group: Some(2000),
            ..Default::default()
        }));

        let container = Container {
            security_context: Some(SecurityContext {
                run_as_user: Some(3000),
                ..Default::default()
            }),
            ..Default::default()
        };

        let run_as = effective_run_as(&pod, &container);
        assert_eq!(run_as, RunAs { uid: 3000, gid: 2000 });
    }
}
