//! The `Host` tagged union: an explicit Rust replacement for the
//! duck-typed `Host` class hierarchy this project was ported from.
//!
//! Every variant knows how to render and parse its own compact textual
//! identifier, and exposes `invert`/label accessors as plain methods
//! rather than relying on isinstance-style dispatch.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::HostError;
use crate::labels::INVERTED_ATTRIBUTE_PREFIX;

pub type LabelMap = BTreeMap<String, String>;

/// A case's target port: either a concrete TCP port or the match-all
/// wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSpec {
    Wildcard,
    Number(u16),
}

impl PortSpec {
    pub const WILDCARD_STR: &'static str = "*";

    pub fn parse(s: &str) -> Self {
        if s == Self::WILDCARD_STR {
            PortSpec::Wildcard
        } else {
            match s.parse::<u16>() {
                Ok(n) => PortSpec::Number(n),
                Err(_) => PortSpec::Wildcard,
            }
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Wildcard => write!(f, "{}", Self::WILDCARD_STR),
            PortSpec::Number(n) => write!(f, "{n}"),
        }
    }
}

/// The five host shapes a `NetworkPolicy` peer or affected workload can
/// take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    /// The machine running the orchestrator/test harness itself; never
    /// materialized in-cluster and never a valid case sender.
    LocalHost,
    /// Anything outside the cluster, addressed by IPv4, IPv6 or DNS
    /// name. Never probed (IP-block peers are dropped before a case
    /// can reference one) but retained as a parseable identifier.
    ExternalHost(String),
    /// A specific, already-known pod or workload.
    ConcreteClusterHost { namespace: String, workload_name: String },
    /// Any pod matching a label selector within one specific namespace.
    ClusterHost { namespace: String, pod_labels: LabelMap },
    /// Any pod matching a label selector in any namespace whose labels
    /// satisfy `namespace_labels`.
    GenericClusterHost { namespace_labels: LabelMap, pod_labels: LabelMap },
}

/// Render a label map as `k=v,k2=v2` (sorted by key, via `BTreeMap`'s
/// iteration order) or `*` when empty.
fn labels_to_string(labels: &LabelMap) -> String {
    if labels.is_empty() {
        return "*".to_string();
    }
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn labels_from_string(s: &str) -> Result<LabelMap, HostError> {
    let mut labels = LabelMap::new();
    if s.is_empty() || s == "*" {
        return Ok(labels);
    }
    for pair in s.split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| HostError::MalformedLabelSelector(pair.to_string()))?;
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}

impl Host {
    /// Render the compact textual identifier for this host, per the
    /// grammar `"localhost" | ip-or-dns | ns-part ":" pod-part`.
    pub fn to_identifier(&self) -> String {
        match self {
            Host::LocalHost => "localhost".to_string(),
            Host::ExternalHost(addr) => addr.clone(),
            Host::ConcreteClusterHost { namespace, workload_name } => {
                format!("{namespace}:{workload_name}")
            }
            Host::ClusterHost { namespace, pod_labels } => {
                format!("{namespace}:{}", labels_to_string(pod_labels))
            }
            Host::GenericClusterHost { namespace_labels, pod_labels } => {
                format!("{}:{}", labels_to_string(namespace_labels), labels_to_string(pod_labels))
            }
        }
    }

    /// Parse a host back from its compact textual identifier. Round
    /// trips with [`Host::to_identifier`] for every variant.
    pub fn from_identifier(id: &str) -> Result<Self, HostError> {
        if id == "localhost" {
            return Ok(Host::LocalHost);
        }
        if id.contains('.') && !id.contains(':') && !id.contains('=') && !id.contains('*') {
            return Ok(Host::ExternalHost(id.to_string()));
        }

        let (left, right) = match id.split_once(':') {
            Some((l, r)) => (l.to_string(), r.to_string()),
            None => ("default".to_string(), id.to_string()),
        };

        let right_is_labels = right == "*" || right.contains('=');
        let pod_labels = if right_is_labels { labels_from_string(&right)? } else { LabelMap::new() };

        if left.contains('=') || left.contains('*') {
            let namespace_labels = labels_from_string(&left)?;
            return Ok(Host::GenericClusterHost { namespace_labels, pod_labels });
        }

        if right_is_labels {
            return Ok(Host::ClusterHost { namespace: left, pod_labels });
        }

        Ok(Host::ConcreteClusterHost { namespace: left, workload_name: right })
    }

    pub fn pod_labels(&self) -> Option<&LabelMap> {
        match self {
            Host::LocalHost | Host::ExternalHost(_) | Host::ConcreteClusterHost { .. } => None,
            Host::ClusterHost { pod_labels, .. } | Host::GenericClusterHost { pod_labels, .. } => Some(pod_labels),
        }
    }

    pub fn namespace_labels(&self) -> Option<&LabelMap> {
        match self {
            Host::GenericClusterHost { namespace_labels, .. } => Some(namespace_labels),
            _ => None,
        }
    }

    /// True for a `ClusterHost`/`GenericClusterHost` with no selectors
    /// at all: matches every pod in its scope (namespace, or cluster
    /// wide for a `GenericClusterHost`).
    pub fn is_match_all(&self) -> bool {
        match self {
            Host::ClusterHost { pod_labels, .. } => pod_labels.is_empty(),
            Host::GenericClusterHost { namespace_labels, pod_labels, .. } => {
                namespace_labels.is_empty() && pod_labels.is_empty()
            }
            _ => false,
        }
    }

    /// Invert this host's label selectors, producing the "everything
    /// but this" host(s) used to synthesize negative test cases (§4.3).
    ///
    /// `ClusterHost`/`GenericClusterHost` with an empty pod-label
    /// selector invert to a single form (only the namespace side can be
    /// meaningfully inverted); otherwise three forms are returned, in
    /// the fixed order namespace-inverted, both-inverted, labels-only-
    /// inverted.
    ///
    /// `LocalHost`/`ExternalHost`/`ConcreteClusterHost` have nothing to
    /// invert; a fully universal `GenericClusterHost` (both selectors
    /// empty) is a programmer error to invert.
    pub fn invert(&self) -> Result<Vec<Host>, HostError> {
        match self {
            Host::LocalHost | Host::ExternalHost(_) | Host::ConcreteClusterHost { .. } => {
                Err(HostError::InvertUniversalHost)
            }
            Host::ClusterHost { namespace, pod_labels } => {
                let inverted_ns = format!("{INVERTED_ATTRIBUTE_PREFIX}{namespace}");
                if pod_labels.is_empty() {
                    Ok(vec![Host::ClusterHost { namespace: inverted_ns, pod_labels: LabelMap::new() }])
                } else {
                    let inverted_labels = invert_labels(pod_labels);
                    Ok(vec![
                        Host::ClusterHost { namespace: inverted_ns.clone(), pod_labels: pod_labels.clone() },
                        Host::ClusterHost { namespace: inverted_ns, pod_labels: inverted_labels.clone() },
                        Host::ClusterHost { namespace: namespace.clone(), pod_labels: inverted_labels },
                    ])
                }
            }
            Host::GenericClusterHost { namespace_labels, pod_labels } => {
                if namespace_labels.is_empty() && pod_labels.is_empty() {
                    return Err(HostError::InvertUniversalHost);
                }
                if namespace_labels.is_empty() {
                    let inverted_labels = invert_labels(pod_labels);
                    return Ok(vec![Host::GenericClusterHost {
                        namespace_labels: LabelMap::new(),
                        pod_labels: inverted_labels,
                    }]);
                }
                let inverted_ns_labels = invert_labels(namespace_labels);
                let inverted_pod_labels = invert_labels(pod_labels);
                Ok(vec![
                    Host::GenericClusterHost { namespace_labels: inverted_ns_labels.clone(), pod_labels: pod_labels.clone() },
                    Host::GenericClusterHost { namespace_labels: inverted_ns_labels, pod_labels: inverted_pod_labels.clone() },
                    Host::GenericClusterHost { namespace_labels: namespace_labels.clone(), pod_labels: inverted_pod_labels },
                ])
            }
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_identifier())
    }
}

/// Prefix every label key with [`crate::labels::INVERTED_ATTRIBUTE_PREFIX`].
fn invert_labels(labels: &LabelMap) -> LabelMap {
    labels
        .iter()
        .map(|(k, v)| (format!("{INVERTED_ATTRIBUTE_PREFIX}{k}"), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn round_trip(h: &Host) {
        let id = h.to_identifier();
        let parsed = Host::from_identifier(&id).expect("should parse");
        assert_eq!(&parsed, h, "round-trip failed for identifier {id:?}");
    }

    #[test]
    fn localhost_round_trips() {
        round_trip(&Host::LocalHost);
        assert_eq!(Host::LocalHost.to_identifier(), "localhost");
    }

    #[test]
    fn external_host_round_trips() {
        round_trip(&Host::ExternalHost("example.com".to_string()));
        round_trip(&Host::ExternalHost("10.0.0.5".to_string()));
    }

    #[test]
    fn concrete_cluster_host_round_trips() {
        let host = Host::ConcreteClusterHost { namespace: "default".to_string(), workload_name: "frontend".to_string() };
        assert_eq!(host.to_identifier(), "default:frontend");
        round_trip(&host);
    }

    #[test]
    fn cluster_host_round_trips_with_labels() {
        let host = Host::ClusterHost { namespace: "default".to_string(), pod_labels: labels(&[("role", "api")]) };
        assert_eq!(host.to_identifier(), "default:role=api");
        round_trip(&host);
    }

    #[test]
    fn cluster_host_with_empty_labels_round_trips_as_wildcard() {
        let host = Host::ClusterHost { namespace: "default".to_string(), pod_labels: LabelMap::new() };
        assert_eq!(host.to_identifier(), "default:*");
        round_trip(&host);
    }

    #[test]
    fn generic_cluster_host_round_trips() {
        let host = Host::GenericClusterHost {
            namespace_labels: labels(&[("env", "prod")]),
            pod_labels: labels(&[("app", "backend"), ("tier", "data")]),
        };
        assert_eq!(host.to_identifier(), "env=prod:app=backend,tier=data");
        round_trip(&host);
    }

    #[test]
    fn generic_cluster_host_with_only_pod_labels_round_trips() {
        let host = Host::GenericClusterHost { namespace_labels: LabelMap::new(), pod_labels: labels(&[("app", "web")]) };
        assert_eq!(host.to_identifier(), "*:app=web");
        round_trip(&host);
    }

    #[test]
    fn universal_generic_host_round_trips() {
        let host = Host::GenericClusterHost { namespace_labels: LabelMap::new(), pod_labels: LabelMap::new() };
        assert_eq!(host.to_identifier(), "*:*");
        round_trip(&host);
    }

    #[test]
    fn invert_universal_host_errors() {
        assert!(matches!(Host::LocalHost.invert(), Err(HostError::InvertUniversalHost)));
        assert!(matches!(Host::ExternalHost("x.com".to_string()).invert(), Err(HostError::InvertUniversalHost)));
        let universal = Host::GenericClusterHost { namespace_labels: LabelMap::new(), pod_labels: LabelMap::new() };
        assert!(matches!(universal.invert(), Err(HostError::InvertUniversalHost)));
    }

    #[test]
    fn invert_cluster_host_with_labels_produces_three_forms() {
        let host = Host::ClusterHost { namespace: "default".to_string(), pod_labels: labels(&[("role", "api")]) };
        let forms = host.invert().unwrap();
        assert_eq!(forms.len(), 3);
        assert_eq!(forms[0].to_identifier(), "connprobe-inverted-default:role=api");
        assert_eq!(forms[1].to_identifier(), "connprobe-inverted-default:connprobe-inverted-role=api");
        assert_eq!(forms[2].to_identifier(), "default:connprobe-inverted-role=api");
    }

    #[test]
    fn invert_cluster_host_with_empty_labels_produces_one_form() {
        let host = Host::ClusterHost { namespace: "default".to_string(), pod_labels: LabelMap::new() };
        let forms = host.invert().unwrap();
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0].to_identifier(), "connprobe-inverted-default:*");
    }

    #[test]
    fn invert_generic_cluster_host_with_empty_ns_labels_produces_one_form() {
        let host = Host::GenericClusterHost { namespace_labels: LabelMap::new(), pod_labels: labels(&[("app", "x")]) };
        let forms = host.invert().unwrap();
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0].to_identifier(), "*:connprobe-inverted-app=x");
    }

    #[test]
    fn invert_generic_cluster_host_produces_three_forms() {
        let host = Host::GenericClusterHost {
            namespace_labels: labels(&[("env", "prod")]),
            pod_labels: labels(&[("app", "x")]),
        };
        let forms = host.invert().unwrap();
        assert_eq!(forms.len(), 3);
        assert_eq!(forms[0].to_identifier(), "connprobe-inverted-env=prod:app=x");
        assert_eq!(forms[1].to_identifier(), "connprobe-inverted-env=prod:connprobe-inverted-app=x");
        assert_eq!(forms[2].to_identifier(), "env=prod:connprobe-inverted-app=x");
    }

    #[test]
    fn is_match_all_detects_empty_selectors() {
        assert!(Host::ClusterHost { namespace: "default".to_string(), pod_labels: LabelMap::new() }.is_match_all());
        assert!(Host::GenericClusterHost { namespace_labels: LabelMap::new(), pod_labels: LabelMap::new() }.is_match_all());
        assert!(!Host::GenericClusterHost { namespace_labels: LabelMap::new(), pod_labels: labels(&[("a", "b")]) }.is_match_all());
    }
}
