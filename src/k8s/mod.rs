//! Thin `kube::Client` wrapper providing the read operations the
//! orchestrator and runner need: a cluster snapshot of
//! Pods/Namespaces/Services/Nodes/NetworkPolicies, and per-node runtime
//! detection.

mod snapshot;

pub use snapshot::{ClusterSnapshot, NamespaceInfo, NodeInfo, PodInfo};

use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, ListParams};
use kube::Client;

use crate::error::OrchestratorError;

/// Namespaces excluded from every cluster snapshot: connprobe never
/// materializes resources into, or synthesizes cases against, these.
pub const EXCLUDED_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

pub struct K8sContext {
    pub client: Client,
}

impl K8sContext {
    pub async fn connect() -> Result<Self, OrchestratorError> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub async fn fetch_snapshot(&self) -> Result<ClusterSnapshot, OrchestratorError> {
        snapshot::fetch(&self.client).await
    }

    /// Read every node's reported container-runtime version string.
    /// `OrchestratorError::AmbiguousRuntime` if nodes disagree or none
    /// report a version at all.
    pub async fn container_runtime(&self) -> Result<String, OrchestratorError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        let mut versions: Vec<String> = list
            .items
            .iter()
            .filter_map(|n| n.status.as_ref()?.node_info.as_ref().map(|i| i.container_runtime_version.clone()))
            .collect();
        versions.sort();
        versions.dedup();
        match versions.as_slice() {
            [single] => Ok(single.clone()),
            _ => Err(OrchestratorError::AmbiguousRuntime),
        }
    }

    pub fn pods_api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn services_api(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn namespaces_api(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    pub fn policies_api(&self, namespace: &str) -> Api<NetworkPolicy> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

pub fn is_excluded_namespace(name: &str) -> bool {
    EXCLUDED_NAMESPACES.contains(&name)
}
