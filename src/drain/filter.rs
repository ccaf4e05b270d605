//! Pod classification for node drains.

use super::DrainOptions;
use crate::error::DrainError;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

/// Annotation the kubelet puts on mirror pods of static manifests
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

pub fn is_mirror_pod(pod: &Pod) -> bool {
    pod.annotations().contains_key(MIRROR_POD_ANNOTATION)
}

pub fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.owner_references().iter().any(|r| r.kind == "DaemonSet")
}

pub fn has_emptydir_volume(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|v| v.empty_dir.is_some()))
}

pub fn has_controller(pod: &Pod) -> bool {
    pod.owner_references()
        .iter()
        .any(|r| r.controller == Some(true))
}

/// Pods that have to leave the node, in listing order.
///
/// Mirror pods are never returned. DaemonSet pods are dropped when ignored.
/// Any pod the options do not allow removing fails the whole call.
pub fn pods_to_evict(pods: Vec<Pod>, opts: &DrainOptions) -> Result<Vec<Pod>, DrainError> {
    let mut selected = Vec::with_capacity(pods.len());
    for pod in pods {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        if is_mirror_pod(&pod) {
            debug!("Skipping static pod {}/{}", namespace, name);
            continue;
        }

        if is_daemonset_pod(&pod) {
            if !opts.ignore_daemonsets {
                return Err(DrainError::DaemonSetPod { namespace, name });
            }
            debug!("Skipping DaemonSet pod {}/{}", namespace, name);
            continue;
        }

        if has_emptydir_volume(&pod) && !opts.delete_emptydir_data {
            return Err(DrainError::EmptyDirPod { namespace, name });
        }

        if !has_controller(&pod) && !opts.force {
            return Err(DrainError::UnmanagedPod { namespace, name });
        }

        selected.push(pod);
    }
    Ok(selected)
}
