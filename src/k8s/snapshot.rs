//! Builds the in-memory cluster snapshot consumed by the policy
//! translator, case generator and orchestrator materialization phases.
//!
//! Grounded on `MannanSaood-Sennet/agent/src/k8s.rs`'s pod/policy
//! watcher-cache pattern, generalized to cover namespaces/services/nodes
//! as one-shot lists rather than a long-lived watch (the orchestrator
//! re-lists explicitly at the start of every phase, P1 `refresh`).

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::ListParams;
use kube::{Api, Client};

use super::is_excluded_namespace;
use crate::error::OrchestratorError;
use crate::host::LabelMap;

#[derive(Debug, Clone)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub labels: LabelMap,
    pub node_name: Option<String>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    pub name: String,
    pub labels: LabelMap,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub is_control_plane: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub pods: Vec<PodInfo>,
    pub namespaces: Vec<NamespaceInfo>,
    pub services: HashMap<String, Vec<k8s_openapi::api::core::v1::Service>>,
    pub nodes: Vec<NodeInfo>,
    pub policies: Vec<NetworkPolicy>,
}

impl ClusterSnapshot {
    pub fn namespace_labels(&self, name: &str) -> LabelMap {
        self.namespaces
            .iter()
            .find(|ns| ns.name == name)
            .map(|ns| ns.labels.clone())
            .unwrap_or_default()
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.iter().map(|ns| ns.name.clone()).collect()
    }

    pub fn non_control_plane_node_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.is_control_plane).count()
    }
}

pub async fn fetch(client: &Client) -> Result<ClusterSnapshot, OrchestratorError> {
    let namespaces_api: Api<Namespace> = Api::all(client.clone());
    let namespace_list = namespaces_api.list(&ListParams::default()).await?;
    let namespaces: Vec<NamespaceInfo> = namespace_list
        .items
        .into_iter()
        .filter_map(|ns| {
            let name = ns.metadata.name?;
            if is_excluded_namespace(&name) {
                return None;
            }
            let labels = ns.metadata.labels.unwrap_or_default().into_iter().collect();
            Some(NamespaceInfo { name, labels })
        })
        .collect();

    let pods_api: Api<Pod> = Api::all(client.clone());
    let pod_list = pods_api.list(&ListParams::default()).await?;
    let pods: Vec<PodInfo> = pod_list
        .items
        .into_iter()
        .filter_map(|pod| {
            let name = pod.metadata.name?;
            let namespace = pod.metadata.namespace.unwrap_or_else(|| "default".to_string());
            if is_excluded_namespace(&namespace) {
                return None;
            }
            let labels = pod.metadata.labels.unwrap_or_default().into_iter().collect();
            let node_name = pod.spec.and_then(|s| s.node_name);
            let ip = pod.status.and_then(|s| s.pod_ip);
            Some(PodInfo { name, namespace, labels, node_name, ip })
        })
        .collect();

    let services_api: Api<Service> = Api::all(client.clone());
    let service_list = services_api.list(&ListParams::default()).await?;
    let mut services: HashMap<String, Vec<Service>> = HashMap::new();
    for svc in service_list.items {
        if let Some(ns) = svc.metadata.namespace.clone() {
            if is_excluded_namespace(&ns) {
                continue;
            }
            services.entry(ns).or_default().push(svc);
        }
    }

    let nodes_api: Api<Node> = Api::all(client.clone());
    let node_list = nodes_api.list(&ListParams::default()).await?;
    let nodes: Vec<NodeInfo> = node_list
        .items
        .into_iter()
        .filter_map(|node| {
            let name = node.metadata.name?;
            let is_control_plane = node
                .metadata
                .labels
                .as_ref()
                .map(|l| {
                    l.contains_key("node-role.kubernetes.io/control-plane")
                        || l.contains_key("node-role.kubernetes.io/master")
                })
                .unwrap_or(false);
            Some(NodeInfo { name, is_control_plane })
        })
        .collect();

    let mut policies = Vec::new();
    for ns in &namespaces {
        let policies_api: Api<NetworkPolicy> = Api::namespaced(client.clone(), &ns.name);
        let list = policies_api.list(&ListParams::default()).await?;
        policies.extend(list.items);
    }

    Ok(ClusterSnapshot { pods, namespaces, services, nodes, policies })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_namespaces(names_and_labels: &[(&str, &[(&str, &str)])]) -> ClusterSnapshot {
        let namespaces = names_and_labels
            .iter()
            .map(|(name, labels)| NamespaceInfo {
                name: name.to_string(),
                labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            })
            .collect();
        ClusterSnapshot { namespaces, ..Default::default() }
    }

    #[test]
    fn namespace_labels_returns_empty_for_unknown_namespace() {
        let snap = snapshot_with_namespaces(&[("default", &[])]);
        assert!(snap.namespace_labels("missing").is_empty());
    }

    #[test]
    fn namespace_labels_finds_the_matching_namespace() {
        let snap = snapshot_with_namespaces(&[("shop", &[("team", "payments")])]);
        let labels = snap.namespace_labels("shop");
        assert_eq!(labels.get("team").map(String::as_str), Some("payments"));
    }

    #[test]
    fn namespace_names_lists_every_namespace_once() {
        let snap = snapshot_with_namespaces(&[("a", &[]), ("b", &[])]);
        let mut names = snap.namespace_names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn non_control_plane_node_count_excludes_control_plane_nodes() {
        let snap = ClusterSnapshot {
            nodes: vec![
                NodeInfo { name: "cp-1".to_string(), is_control_plane: true },
                NodeInfo { name: "worker-1".to_string(), is_control_plane: false },
                NodeInfo { name: "worker-2".to_string(), is_control_plane: false },
            ],
            ..Default::default()
        };
        assert_eq!(snap.non_control_plane_node_count(), 2);
    }
}
