//! Resolve a local sender pod's container PID so its network namespace
//! can be entered. Two adapters, selected by the runtime flavor the
//! orchestrator baked into the DaemonSet's `CONNPROBE_RUNTIME_FLAVOR`
//! env var: a CRI adapter (`crictl inspect`) and a legacy Docker
//! adapter (k8s API pod UID -> container cgroup path -> `docker
//! inspect`).
//!
//! Grounded on the cgroup-path parsing in
//! `examples/MannanSaood-Sennet/agent/src/docker.rs`
//! (`extract_docker_systemd_id`/`extract_containerd_id`), generalized
//! from "is this process containerized" diagnostics into "find me the
//! PID of this specific pod's first container".

use std::process::Command;

use serde::Deserialize;

use crate::error::RunnerError;
use crate::orchestrator::RuntimeFlavor;

/// Find the PID of the first container in `namespace/pod_name`'s pod,
/// suitable for entering its network namespace via `/proc/<pid>/ns/net`.
pub fn resolve_container_pid(flavor: RuntimeFlavor, namespace: &str, pod_name: &str) -> Result<u32, RunnerError> {
    match flavor {
        RuntimeFlavor::Cri => resolve_via_crictl(namespace, pod_name),
        RuntimeFlavor::Docker => resolve_via_docker(namespace, pod_name),
    }
}

#[derive(Debug, Deserialize)]
struct CrictlPodSandbox {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CrictlPodSandboxList {
    items: Vec<CrictlPodSandbox>,
}

#[derive(Debug, Deserialize)]
struct CrictlInspectInfo {
    pid: u32,
}

#[derive(Debug, Deserialize)]
struct CrictlInspectResponse {
    info: CrictlInspectInfo,
}

fn resolve_via_crictl(namespace: &str, pod_name: &str) -> Result<u32, RunnerError> {
    let list_output = Command::new("crictl")
        .args([
            "pods",
            "--namespace",
            namespace,
            "--name",
            pod_name,
            "-o",
            "json",
        ])
        .output()
        .map_err(RunnerError::Io)?;

    if !list_output.status.success() {
        return Err(RunnerError::NamespaceResolution {
            namespace: namespace.to_string(),
            pod: pod_name.to_string(),
            reason: format!("crictl pods exited with {}", list_output.status),
        });
    }

    let list: CrictlPodSandboxList = serde_json::from_slice(&list_output.stdout).map_err(|e| RunnerError::NamespaceResolution {
        namespace: namespace.to_string(),
        pod: pod_name.to_string(),
        reason: format!("failed to parse crictl pods output: {e}"),
    })?;

    let sandbox_id = list.items.first().ok_or_else(|| RunnerError::NamespaceResolution {
        namespace: namespace.to_string(),
        pod: pod_name.to_string(),
        reason: "no matching pod sandbox reported by crictl".to_string(),
    })?;

    let inspect_output = Command::new("crictl")
        .args(["inspectp", "-o", "json", &sandbox_id.id])
        .output()
        .map_err(RunnerError::Io)?;

    if !inspect_output.status.success() {
        return Err(RunnerError::NamespaceResolution {
            namespace: namespace.to_string(),
            pod: pod_name.to_string(),
            reason: format!("crictl inspectp exited with {}", inspect_output.status),
        });
    }

    let inspected: CrictlInspectResponse = serde_json::from_slice(&inspect_output.stdout).map_err(|e| RunnerError::NamespaceResolution {
        namespace: namespace.to_string(),
        pod: pod_name.to_string(),
        reason: format!("failed to parse crictl inspectp output: {e}"),
    })?;

    Ok(inspected.info.pid)
}

#[derive(Debug, Deserialize)]
struct DockerInspectState {
    #[serde(rename = "Pid")]
    pid: u32,
}

#[derive(Debug, Deserialize)]
struct DockerInspectEntry {
    #[serde(rename = "State")]
    state: DockerInspectState,
}

/// Legacy dockershim path: find the container whose name embeds the
/// pod's UID (the convention kubelet uses under dockershim), then
/// `docker inspect` it for its PID.
fn resolve_via_docker(namespace: &str, pod_name: &str) -> Result<u32, RunnerError> {
    let ps_output = Command::new("docker")
        .args([
            "ps",
            "--filter",
            &format!("label=io.kubernetes.pod.namespace={namespace}"),
            "--filter",
            &format!("label=io.kubernetes.pod.name={pod_name}"),
            "--format",
            "{{.ID}}",
        ])
        .output()
        .map_err(RunnerError::Io)?;

    if !ps_output.status.success() {
        return Err(RunnerError::NamespaceResolution {
            namespace: namespace.to_string(),
            pod: pod_name.to_string(),
            reason: format!("docker ps exited with {}", ps_output.status),
        });
    }

    let container_id = String::from_utf8_lossy(&ps_output.stdout)
        .lines()
        .next()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RunnerError::NamespaceResolution {
            namespace: namespace.to_string(),
            pod: pod_name.to_string(),
            reason: "no running container matches this pod's labels".to_string(),
        })?;

    let inspect_output = Command::new("docker")
        .args(["inspect", &container_id])
        .output()
        .map_err(RunnerError::Io)?;

    if !inspect_output.status.success() {
        return Err(RunnerError::NamespaceResolution {
            namespace: namespace.to_string(),
            pod: pod_name.to_string(),
            reason: format!("docker inspect exited with {}", inspect_output.status),
        });
    }

    let entries: Vec<DockerInspectEntry> = serde_json::from_slice(&inspect_output.stdout).map_err(|e| RunnerError::NamespaceResolution {
        namespace: namespace.to_string(),
        pod: pod_name.to_string(),
        reason: format!("failed to parse docker inspect output: {e}"),
    })?;

    entries
        .first()
        .map(|e| e.state.pid)
        .ok_or_else(|| RunnerError::NamespaceResolution {
            namespace: namespace.to_string(),
            pod: pod_name.to_string(),
            reason: "docker inspect returned no entries".to_string(),
        })
}
