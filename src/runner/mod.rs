//! Per-node runner agent: resolves which cases have a local sender,
//! scans each target from inside that sender's network namespace, and
//! publishes one result ConfigMap for this node.

pub mod netns;
pub mod runtime;
pub mod scan;

use std::collections::BTreeMap;
use std::time::Instant;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tracing::{info, warn};

use crate::case::{CasePlan, NetworkTestCase, PortResult, ResultArtifact};
use crate::error::RunnerError;
use crate::host::PortSpec;
use crate::labels::{Role, CLEANUP_ALWAYS, CLEANUP_LABEL, ROLE_LABEL};
use crate::orchestrator::RuntimeFlavor;

pub struct RunnerConfig {
    pub node_name: String,
    pub project_namespace: String,
    pub runtime_flavor: RuntimeFlavor,
}

/// Step 1/2: list pods scheduled to this node, and restrict them to
/// those appearing as a sender (`from`) in the published case plan.
pub async fn local_sender_pods(client: &Client, config: &RunnerConfig) -> Result<Vec<Pod>, RunnerError> {
    let pods_api: Api<Pod> = Api::all(client.clone());
    let list = pods_api
        .list(&ListParams::default().fields(&format!("spec.nodeName={}", config.node_name)))
        .await?;
    Ok(list.items)
}

/// Step 2: read the published case plan ConfigMap and keep only the
/// `from -> to -> [port_string]` entries whose `from` identifies a pod
/// local to this node.
pub fn filter_plan_for_local_senders(plan: &CasePlan, local_pod_identifiers: &[String]) -> CasePlan {
    plan.iter()
        .filter(|(from, _)| local_pod_identifiers.iter().any(|id| id == *from))
        .map(|(from, to_map)| (from.clone(), to_map.clone()))
        .collect()
}

pub async fn fetch_case_plan(client: &Client, project_namespace: &str) -> Result<CasePlan, RunnerError> {
    let cm_api: Api<ConfigMap> = Api::namespaced(client.clone(), project_namespace);
    let cm = cm_api.get("connprobe-cases").await?;
    let raw = cm
        .data
        .as_ref()
        .and_then(|d| d.get("cases.yaml"))
        .cloned()
        .unwrap_or_default();
    serde_yaml::from_str(&raw).map_err(RunnerError::from)
}

/// Steps 3-6: for one local sender pod, enter its network namespace
/// once and scan every target it has cases against, keyed by the
/// original signed port string. Returns the per-port results alongside
/// each target's wall-clock scan duration, published as the result
/// artifact's `runtimes` field.
pub fn run_cases_for_sender(
    config: &RunnerConfig,
    sender_identifier: &str,
    sender_pid: u32,
    targets: &BTreeMap<String, Vec<String>>,
    target_ips: &BTreeMap<String, String>,
) -> Result<(BTreeMap<String, BTreeMap<String, PortResult>>, BTreeMap<String, String>), RunnerError> {
    let guard = netns::NetnsGuard::enter(sender_pid)?;

    let mut results: BTreeMap<String, BTreeMap<String, PortResult>> = BTreeMap::new();
    let mut runtimes: BTreeMap<String, String> = BTreeMap::new();

    for (target_identifier, port_strings) in targets {
        let started = Instant::now();
        let runtime_key = format!("{sender_identifier}->{target_identifier}");
        let Some(target_ip) = target_ips.get(target_identifier) else {
            let mut port_map = BTreeMap::new();
            for ps in port_strings {
                port_map.insert(
                    ps.clone(),
                    PortResult {
                        success: false,
                        nmap_state: None,
                        error: Some("no IP address known for target".to_string()),
                    },
                );
            }
            results.insert(target_identifier.clone(), port_map);
            runtimes.insert(runtime_key, format!("{:.3}s", started.elapsed().as_secs_f64()));
            continue;
        };

        // original_key is what the result gets published under; dial_port
        // is the concrete port actually scanned (they differ exactly when
        // materialization rewrote a wildcard to a service's port).
        let pairs: Vec<(String, PortSpec)> = port_strings
            .iter()
            .map(|ps| NetworkTestCase::parse_wire_port_string(ps))
            .collect();
        let dial_ports: Vec<PortSpec> = pairs.iter().map(|(_, p)| *p).collect();

        let scanned = match scan::scan_ports(target_ip, &dial_ports) {
            Ok(scanned) => scanned,
            Err(e) => {
                warn!(target = %target_identifier, error = %e, "scan failed for target, recording per-port failure");
                dial_ports
                    .iter()
                    .map(|p| (*p, PortResult { success: false, nmap_state: None, error: Some(e.to_string()) }))
                    .collect()
            }
        };

        let mut port_map = BTreeMap::new();
        for (original_key, dial_port) in &pairs {
            let (_, expected_connect) = NetworkTestCase::parse_port_string(original_key);
            let result = scanned
                .iter()
                .find(|(p, _)| p == dial_port)
                .map(|(_, r)| PortResult {
                    success: r.success == expected_connect,
                    nmap_state: r.nmap_state.clone(),
                    error: r.error.clone(),
                })
                .unwrap_or(PortResult {
                    success: false,
                    nmap_state: None,
                    error: Some("no scan result for this port".to_string()),
                });
            port_map.insert(original_key.clone(), result);
        }
        results.insert(target_identifier.clone(), port_map);
        runtimes.insert(runtime_key, format!("{:.3}s", started.elapsed().as_secs_f64()));
    }

    drop(guard);
    info!(sender = %sender_identifier, targets = results.len(), "finished scanning targets for sender");
    Ok((results, runtimes))
}

/// Step 7: publish this node's result ConfigMap, creating it or
/// patching it in place if a previous run already left one behind.
pub async fn publish_results(
    client: &Client,
    config: &RunnerConfig,
    runner_pod_name: &str,
    artifact: &ResultArtifact,
) -> Result<(), RunnerError> {
    let results_yaml = serde_yaml::to_string(artifact)?;
    let mut data = BTreeMap::new();
    data.insert("results".to_string(), results_yaml);

    let mut labels = BTreeMap::new();
    labels.insert(CLEANUP_LABEL.to_string(), CLEANUP_ALWAYS.to_string());
    labels.insert(ROLE_LABEL.to_string(), Role::ResultConfigMap.as_str().to_string());

    let cm_name = format!("{runner_pod_name}-results");
    let cm = ConfigMap {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(cm_name.clone()),
            namespace: Some(config.project_namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };

    let cm_api: Api<ConfigMap> = Api::namespaced(client.clone(), &config.project_namespace);
    match cm_api.get(&cm_name).await {
        Ok(_) => {
            cm_api
                .patch(&cm_name, &PatchParams::apply("connprobe-runner"), &Patch::Merge(&cm))
                .await?;
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            cm_api.create(&PostParams::default(), &cm).await?;
        }
        Err(e) => return Err(e.into()),
    }

    info!(configmap = %cm_name, "published runner result ConfigMap");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_plan_keeps_only_local_senders() {
        let mut plan = CasePlan::new();
        plan.insert("default/local-pod:*".to_string(), BTreeMap::new());
        plan.insert("default/remote-pod:*".to_string(), BTreeMap::new());

        let local = vec!["default/local-pod:*".to_string()];
        let filtered = filter_plan_for_local_senders(&plan, &local);

        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("default/local-pod:*"));
    }
}
