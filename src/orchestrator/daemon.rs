//! P6: launch the per-node runner DaemonSet and wait for it to become
//! ready.
//!
//! Grounded on `createDaemonset`/`_create_daemon_set_if_missing` in
//! `test_orchestrator.py`: the DaemonSet manifest varies by the
//! cluster's container runtime (the runner needs a different hostPath
//! mount / socket to reach crictl vs. the legacy dockershim socket),
//! and creation is idempotent. The readiness poll reuses the
//! `ExponentialBackoff` idiom from
//! `examples/MannanSaood-Sennet/agent/src/heartbeat.rs::send_heartbeat`.

use std::collections::BTreeMap;
use std::time::Duration;

use backoff::{future::retry, Error as BackoffError, ExponentialBackoff};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, PodSpec, PodTemplateSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::error::OrchestratorError;
use crate::labels::{Role, CLEANUP_ALWAYS, CLEANUP_LABEL, DAEMONSET_NAME, ROLE_LABEL};

/// Which flavor of container runtime the cluster's nodes report, and so
/// which socket the runner's node-local adapter needs mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFlavor {
    /// containerd/CRI-O, anything speaking the CRI `crictl` socket.
    Cri,
    /// Legacy dockershim / standalone Docker Engine.
    Docker,
}

impl RuntimeFlavor {
    /// Recognize the `<runtime>://<version>` string nodes report.
    /// `docker` maps to the legacy dockershim adapter; `containerd`
    /// (and any other CRI-speaking runtime sharing its socket
    /// convention) maps to the CRI adapter. Anything else is rejected
    /// rather than guessed at.
    pub fn from_version_string(version: &str) -> Result<Self, OrchestratorError> {
        if version.starts_with("docker://") {
            Ok(RuntimeFlavor::Docker)
        } else if version.starts_with("containerd://") {
            Ok(RuntimeFlavor::Cri)
        } else {
            Err(OrchestratorError::UnsupportedRuntime(version.to_string()))
        }
    }

    fn socket_path(&self) -> &'static str {
        match self {
            RuntimeFlavor::Cri => "/run/containerd/containerd.sock",
            RuntimeFlavor::Docker => "/var/run/docker.sock",
        }
    }

    fn env_value(&self) -> &'static str {
        match self {
            RuntimeFlavor::Cri => "cri",
            RuntimeFlavor::Docker => "docker",
        }
    }
}

/// Launch (or reuse) the runner DaemonSet, then block until at least
/// one pod per non-control-plane node reports Ready. Returns the names
/// of the runner pods the collector should expect results from.
pub async fn launch_runners(orch: &Orchestrator) -> Result<Vec<String>, OrchestratorError> {
    let runtime_version = orch.ctx.container_runtime().await?;
    let flavor = RuntimeFlavor::from_version_string(&runtime_version)?;
    info!(?flavor, runtime_version, "detected cluster container runtime");

    ensure_daemonset(orch, flavor).await?;
    wait_for_ready(orch).await
}

async fn ensure_daemonset(orch: &Orchestrator, flavor: RuntimeFlavor) -> Result<(), OrchestratorError> {
    let api: Api<DaemonSet> = Api::namespaced(orch.ctx.client.clone(), &orch.config.project_namespace);

    let mut labels = BTreeMap::new();
    labels.insert(CLEANUP_LABEL.to_string(), CLEANUP_ALWAYS.to_string());
    labels.insert(ROLE_LABEL.to_string(), Role::RunnerDaemonSet.as_str().to_string());

    let mut selector_labels = BTreeMap::new();
    selector_labels.insert("app".to_string(), DAEMONSET_NAME.to_string());

    let daemonset = DaemonSet {
        metadata: ObjectMeta {
            name: Some(DAEMONSET_NAME.to_string()),
            namespace: Some(orch.config.project_namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some("connprobe-runner".to_string()),
                    host_network: Some(true),
                    host_pid: Some(true),
                    containers: vec![Container {
                        name: "connprobe-runner".to_string(),
                        image: Some(orch.config.runner_image.clone()),
                        env: Some(vec![
                            k8s_openapi::api::core::v1::EnvVar {
                                name: "CONNPROBE_RUNTIME_FLAVOR".to_string(),
                                value: Some(flavor.env_value().to_string()),
                                ..Default::default()
                            },
                            k8s_openapi::api::core::v1::EnvVar {
                                name: "CONNPROBE_PROJECT_NAMESPACE".to_string(),
                                value: Some(orch.config.project_namespace.clone()),
                                ..Default::default()
                            },
                            k8s_openapi::api::core::v1::EnvVar {
                                name: "NODE_NAME".to_string(),
                                value_from: Some(k8s_openapi::api::core::v1::EnvVarSource {
                                    field_ref: Some(k8s_openapi::api::core::v1::ObjectFieldSelector {
                                        field_path: "spec.nodeName".to_string(),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                            k8s_openapi::api::core::v1::EnvVar {
                                name: "POD_NAME".to_string(),
                                value_from: Some(k8s_openapi::api::core::v1::EnvVarSource {
                                    field_ref: Some(k8s_openapi::api::core::v1::ObjectFieldSelector {
                                        field_path: "metadata.name".to_string(),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ]),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "runtime-socket".to_string(),
                            mount_path: flavor.socket_path().to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "runtime-socket".to_string(),
                        host_path: Some(HostPathVolumeSource {
                            path: flavor.socket_path().to_string(),
                            type_: None,
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    };

    match api.get(DAEMONSET_NAME).await {
        Ok(_) => {
            debug!("runner DaemonSet already exists, patching image/flavor in place");
            api.patch(
                DAEMONSET_NAME,
                &PatchParams::apply("connprobe"),
                &Patch::Apply(&daemonset),
            )
            .await?;
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            api.create(&PostParams::default(), &daemonset).await?;
            info!("created runner DaemonSet");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

async fn wait_for_ready(orch: &Orchestrator) -> Result<Vec<String>, OrchestratorError> {
    let expected = orch.snapshot.non_control_plane_node_count().max(1);
    let pods_api: Api<k8s_openapi::api::core::v1::Pod> =
        Api::namespaced(orch.ctx.client.clone(), &orch.config.project_namespace);

    let backoff_config = ExponentialBackoff {
        initial_interval: Duration::from_secs(orch.config.daemon_ready_poll_interval_secs),
        max_interval: Duration::from_secs(orch.config.daemon_ready_poll_interval_secs * 4),
        max_elapsed_time: Some(Duration::from_secs(orch.config.daemon_ready_timeout_secs)),
        ..Default::default()
    };

    let result = retry(backoff_config, || async {
        let list = pods_api
            .list(&ListParams::default().labels(&format!("app={DAEMONSET_NAME}")))
            .await
            .map_err(|e| BackoffError::permanent(OrchestratorError::from(e)))?;

        let ready: Vec<String> = list
            .items
            .iter()
            .filter(|p| pod_is_ready(p))
            .filter_map(|p| p.metadata.name.clone())
            .collect();

        if ready.len() >= expected {
            Ok(ready)
        } else {
            warn!(ready = ready.len(), expected, "waiting for runner DaemonSet to become ready");
            Err(BackoffError::transient(OrchestratorError::DaemonNotReady))
        }
    })
    .await;

    result.map_err(|_| OrchestratorError::DaemonNotReady)
}

fn pod_is_ready(pod: &k8s_openapi::api::core::v1::Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_version_string_selects_docker_flavor() {
        assert_eq!(
            RuntimeFlavor::from_version_string("docker://20.10.17").unwrap(),
            RuntimeFlavor::Docker
        );
    }

    #[test]
    fn containerd_version_string_selects_cri_flavor() {
        assert_eq!(
            RuntimeFlavor::from_version_string("containerd://1.6.8").unwrap(),
            RuntimeFlavor::Cri
        );
    }

    #[test]
    fn unrecognized_runtime_prefix_is_rejected() {
        assert!(matches!(
            RuntimeFlavor::from_version_string("cri-o://1.26.0"),
            Err(OrchestratorError::UnsupportedRuntime(_))
        ));
    }
}
