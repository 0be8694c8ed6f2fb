//! Translates a Kubernetes `NetworkPolicy` into the [`Rule`]/[`Connection`]
//! shapes the case generator consumes.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tracing::debug;

use crate::error::RuleError;
use crate::host::{Host, LabelMap, PortSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// One allowed connection between two hosts on one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub from: Host,
    pub to: Host,
    pub on_port: PortSpec,
}

/// A single ingress or egress rule extracted from one `NetworkPolicy`.
///
/// `concerns` is the selector of the workloads this rule governs - a
/// `ClusterHost(namespace, podLabels)`, never a `ConcreteClusterHost`:
/// the translator never resolves a selector down to one specific pod.
#[derive(Debug, Clone)]
pub struct Rule {
    pub concerns: Host,
    pub direction: Direction,
    pub connections: Vec<Connection>,
}

impl Rule {
    /// Build every ingress/egress `Rule` declared by a `NetworkPolicy`.
    ///
    /// A `policyTypes` entry with no corresponding rule array still
    /// yields one deny-all `Rule` (zero connections) for that direction,
    /// matching Kubernetes' isolation semantics for a bare policy.
    pub fn from_network_policy(policy: &NetworkPolicy) -> Result<Vec<Rule>, RuleError> {
        let name = policy.metadata.name.clone().unwrap_or_default();
        let namespace = policy
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let spec = policy
            .spec
            .as_ref()
            .ok_or_else(|| RuleError::MissingPodSelector(format!("{namespace}/{name}")))?;

        let affected_pod_labels = extract_selector(&spec.pod_selector, &namespace, &name)?;
        let concerns = Host::ClusterHost { namespace: namespace.clone(), pod_labels: affected_pod_labels };

        let mut rules = Vec::new();

        // §4.1 keys purely off `ingress`/`egress` field presence, never
        // `policyTypes` - a policy can declare ingress rules without
        // listing "Ingress" in `policyTypes` and still be isolating.
        if let Some(ingress_rules) = &spec.ingress {
            let mut connections = Vec::new();
            for ingress in ingress_rules {
                let peers = ingress.from.as_deref().unwrap_or(&[]);
                let ports = ingress.ports.as_deref();
                connections.extend(build_connections(
                    peers,
                    ports,
                    &concerns,
                    Direction::Incoming,
                    &namespace,
                    &name,
                )?);
            }
            rules.push(Rule { concerns: concerns.clone(), direction: Direction::Incoming, connections });
        }

        if let Some(egress_rules) = &spec.egress {
            let mut connections = Vec::new();
            for egress in egress_rules {
                let peers = egress.to.as_deref().unwrap_or(&[]);
                let ports = egress.ports.as_deref();
                connections.extend(build_connections(
                    peers,
                    ports,
                    &concerns,
                    Direction::Outgoing,
                    &namespace,
                    &name,
                )?);
            }
            rules.push(Rule { concerns, direction: Direction::Outgoing, connections });
        }

        Ok(rules)
    }
}

fn build_connections(
    peers: &[NetworkPolicyPeer],
    ports: Option<&[NetworkPolicyPort]>,
    affected_pod: &Host,
    direction: Direction,
    namespace: &str,
    policy_name: &str,
) -> Result<Vec<Connection>, RuleError> {
    let port_specs = ports_to_specs(ports);
    let mut connections = Vec::new();

    if peers.is_empty() {
        // No peer restriction: allow all.
        let other = Host::GenericClusterHost { namespace_labels: LabelMap::new(), pod_labels: LabelMap::new() };
        for port in &port_specs {
            connections.push(make_connection(affected_pod, &other, *port, direction));
        }
        return Ok(connections);
    }

    for peer in peers {
        if peer.ip_block.is_some() {
            debug!(
                cidr = ?peer.ip_block.as_ref().map(|b| &b.cidr),
                "dropping IP-block peer in {}/{}: external hosts are not probed",
                namespace,
                policy_name
            );
            continue;
        }

        let other = peer_to_host(peer, namespace, policy_name)?;
        for port in &port_specs {
            connections.push(make_connection(affected_pod, &other, *port, direction));
        }
    }

    Ok(connections)
}

fn make_connection(affected_pod: &Host, other: &Host, port: PortSpec, direction: Direction) -> Connection {
    match direction {
        Direction::Incoming => Connection { from: other.clone(), to: affected_pod.clone(), on_port: port },
        Direction::Outgoing => Connection { from: affected_pod.clone(), to: other.clone(), on_port: port },
    }
}

fn ports_to_specs(ports: Option<&[NetworkPolicyPort]>) -> Vec<PortSpec> {
    match ports {
        None => vec![PortSpec::Wildcard],
        Some(ports) if ports.is_empty() => vec![PortSpec::Wildcard],
        Some(ports) => ports
            .iter()
            .map(|p| match &p.port {
                Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(n)) => {
                    PortSpec::Number(*n as u16)
                }
                // Symbolic (named) ports are not resolved against
                // container specs - best-effort treats them as "any".
                Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(_)) => {
                    PortSpec::Wildcard
                }
                None => PortSpec::Wildcard,
            })
            .collect(),
    }
}

fn peer_to_host(peer: &NetworkPolicyPeer, default_namespace: &str, policy_name: &str) -> Result<Host, RuleError> {
    let pod_labels = match &peer.pod_selector {
        Some(sel) => extract_selector(sel, default_namespace, policy_name)?,
        None => LabelMap::new(),
    };

    match &peer.namespace_selector {
        Some(ns_sel) => {
            let namespace_labels = extract_selector(ns_sel, default_namespace, policy_name)?;
            Ok(Host::GenericClusterHost { namespace_labels, pod_labels })
        }
        None => Ok(Host::ClusterHost { namespace: default_namespace.to_string(), pod_labels }),
    }
}

/// Convert a `matchLabels`-only `LabelSelector` to a plain map.
///
/// `matchExpressions` selectors are rejected outright: this project
/// only supports equality-based selection.
fn extract_selector(selector: &LabelSelector, namespace: &str, name: &str) -> Result<LabelMap, RuleError> {
    if selector.match_expressions.as_ref().is_some_and(|e| !e.is_empty()) {
        return Err(RuleError::UnsupportedSelector {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
    let match_labels: BTreeMap<String, String> = selector.match_labels.clone().unwrap_or_default();
    Ok(match_labels)
}
