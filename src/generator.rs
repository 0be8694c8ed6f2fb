//! Derives positive and negative [`NetworkTestCase`]s from a set of
//! [`Rule`]s.
//!
//! Pure and I/O-free: anything the algorithm needs to know about the
//! live cluster (which namespaces exist, what labels they carry) is
//! passed in by the caller rather than fetched through a shared mutable
//! singleton, per the "inject `resolveNamespaceLabels`" redesign
//! directive.

use std::collections::HashSet;

use crate::case::NetworkTestCase;
use crate::host::{Host, LabelMap, PortSpec};
use crate::labels::random_port_excluding;
use crate::rule::{Direction, Rule};

pub struct TestCaseGenerator;

impl TestCaseGenerator {
    /// Generate every positive case (one per declared connection) and
    /// every negative case derivable from incoming rules, in the
    /// order `outgoing-positives ++ negatives ++ incoming-positives`.
    ///
    /// `all_namespaces` and `resolve_namespace_labels` together let the
    /// generator reason about which namespaces a `GenericClusterHost`'s
    /// namespace selector actually resolves to, without owning a cache
    /// of cluster state itself.
    pub fn generate(
        rules: &[Rule],
        all_namespaces: &[String],
        resolve_namespace_labels: &dyn Fn(&str) -> LabelMap,
    ) -> Vec<NetworkTestCase> {
        // Step 1: every affected selector is isolated by default,
        // accumulated in first-seen order.
        let mut isolated: Vec<Host> = Vec::new();
        for rule in rules {
            if !isolated.contains(&rule.concerns) {
                isolated.push(rule.concerns.clone());
            }
        }

        // Step 2: positive cases, direction-tagged, plus the peer-host
        // population used for overlap analysis.
        let mut outgoing_positives = Vec::new();
        let mut incoming_positives = Vec::new();
        let mut others: Vec<Host> = Vec::new();
        for rule in rules {
            for conn in &rule.connections {
                let case = NetworkTestCase::new(conn.from.clone(), conn.to.clone(), conn.on_port, true);
                let peer = match rule.direction {
                    Direction::Incoming => &conn.from,
                    Direction::Outgoing => &conn.to,
                };
                if !others.contains(peer) {
                    others.push(peer.clone());
                }
                match rule.direction {
                    Direction::Incoming => incoming_positives.push(case),
                    Direction::Outgoing => outgoing_positives.push(case),
                }
            }
        }

        // Step 3: negative cases, synthesized only from incoming
        // constraints - a known limitation (outgoing rules never
        // produce a negative probe; see SPEC_FULL.md Open Questions).
        let mut negatives = Vec::new();
        for h in &isolated {
            negatives.extend(negative_cases_for_isolated_host(
                h,
                &isolated,
                &others,
                &incoming_positives,
                all_namespaces,
                resolve_namespace_labels,
            ));
        }

        let mut out = Vec::with_capacity(outgoing_positives.len() + negatives.len() + incoming_positives.len());
        out.extend(outgoing_positives);
        out.extend(negatives);
        out.extend(incoming_positives);
        out
    }
}

/// One sender host appearing in `A(h)`, together with every port it is
/// positively allowed to reach `h` (or a host overlapping `h`) on.
struct Reacher {
    host: Host,
    ports: Vec<PortSpec>,
}

fn negative_cases_for_isolated_host(
    h: &Host,
    isolated: &[Host],
    others: &[Host],
    incoming_positives: &[NetworkTestCase],
    all_namespaces: &[String],
    resolve_namespace_labels: &dyn Fn(&str) -> LabelMap,
) -> Vec<NetworkTestCase> {
    // O(h): h itself plus every isolated/other host whose namespace and
    // pod-label selector overlap h's.
    let population: Vec<&Host> = isolated.iter().chain(others.iter()).collect();
    let mut overlap_set: Vec<Host> = vec![h.clone()];
    for x in &population {
        if hosts_overlap(h, x, all_namespaces, resolve_namespace_labels) && !overlap_set.contains(x) {
            overlap_set.push((*x).clone());
        }
    }

    // A(h): every distinct sender of a positive incoming case whose
    // target lies in O(h), with the full set of ports it's allowed on.
    let mut reachers: Vec<Reacher> = Vec::new();
    for case in incoming_positives {
        if !overlap_set.contains(&case.to) {
            continue;
        }
        if let Some(r) = reachers.iter_mut().find(|r| r.host == case.from) {
            if !r.ports.contains(&case.on_port) {
                r.ports.push(case.on_port);
            }
        } else {
            reachers.push(Reacher { host: case.from.clone(), ports: vec![case.on_port] });
        }
    }

    if reachers.is_empty() {
        // Nothing reaches this host at all: a single self-denial probe
        // documents that every connection should be blocked.
        return vec![NetworkTestCase::new(h.clone(), h.clone(), PortSpec::Wildcard, false)];
    }

    if let Some(universal) = reachers.iter().find(|r| r.host.is_match_all()) {
        if universal.ports.iter().any(|p| matches!(p, PortSpec::Wildcard)) {
            // Everything is already allowed; there's nothing left to
            // deny.
            return Vec::new();
        }
        let allowed_ports: HashSet<u16> = universal
            .ports
            .iter()
            .filter_map(|p| match p {
                PortSpec::Number(n) => Some(*n),
                PortSpec::Wildcard => None,
            })
            .collect();
        return match random_port_excluding(&allowed_ports) {
            Ok(port) => vec![NetworkTestCase::new(universal.host.clone(), h.clone(), PortSpec::Number(port), false)],
            Err(_) => Vec::new(),
        };
    }

    // Otherwise, invert every sender in A(h) and keep only the forms
    // that don't also overlap some other member of A(h) - i.e. the
    // maximal inversion directions not already covered by another
    // allowance.
    let mut out = Vec::new();
    for reacher in &reachers {
        let Ok(inverted_forms) = reacher.host.invert() else { continue };
        let port = reacher.ports.first().copied().unwrap_or(PortSpec::Wildcard);
        for inverted in inverted_forms {
            let covered_elsewhere = reachers
                .iter()
                .any(|other| other.host != inverted && hosts_overlap(&inverted, &other.host, all_namespaces, resolve_namespace_labels));
            if !covered_elsewhere {
                out.push(NetworkTestCase::new(inverted, h.clone(), port, false));
            }
        }
    }
    out
}

/// True if two hosts could simultaneously match the same live pod: their
/// namespace sets intersect and their pod-label selectors are
/// compatible (neither excludes the other).
fn hosts_overlap(
    a: &Host,
    b: &Host,
    all_namespaces: &[String],
    resolve_namespace_labels: &dyn Fn(&str) -> LabelMap,
) -> bool {
    let ns_a = namespace_set_for(a, all_namespaces, resolve_namespace_labels);
    let ns_b = namespace_set_for(b, all_namespaces, resolve_namespace_labels);
    if ns_a.is_disjoint(&ns_b) {
        return false;
    }
    labels_overlap(a.pod_labels(), b.pod_labels())
}

fn namespace_set_for(
    host: &Host,
    all_namespaces: &[String],
    resolve_namespace_labels: &dyn Fn(&str) -> LabelMap,
) -> HashSet<String> {
    match host {
        Host::LocalHost | Host::ExternalHost(_) => HashSet::new(),
        Host::ConcreteClusterHost { namespace, .. } | Host::ClusterHost { namespace, .. } => {
            [namespace.clone()].into_iter().collect()
        }
        Host::GenericClusterHost { namespace_labels, .. } => {
            if namespace_labels.is_empty() {
                all_namespaces.iter().cloned().collect()
            } else {
                all_namespaces
                    .iter()
                    .filter(|ns| {
                        let live_labels = resolve_namespace_labels(ns);
                        namespace_labels.iter().all(|(k, v)| live_labels.get(k) == Some(v))
                    })
                    .cloned()
                    .collect()
            }
        }
    }
}

/// Two label selectors overlap when they share at least one `k=v`
/// pair; an empty selector overlaps everything (it matches all).
fn labels_overlap(a: Option<&LabelMap>, b: Option<&LabelMap>) -> bool {
    match (a, b) {
        (None, _) | (_, None) => false,
        (Some(a), Some(b)) => {
            if a.is_empty() || b.is_empty() {
                return true;
            }
            a.iter().any(|(k, v)| b.get(k) == Some(v))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Connection;

    fn cluster_host(ns: &str, labels: &[(&str, &str)]) -> Host {
        Host::ClusterHost {
            namespace: ns.to_string(),
            pod_labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn match_all() -> Host {
        Host::GenericClusterHost { namespace_labels: LabelMap::new(), pod_labels: LabelMap::new() }
    }

    fn no_namespace_labels(_: &str) -> LabelMap {
        LabelMap::new()
    }

    #[test]
    fn generates_one_positive_case_per_connection() {
        let affected = cluster_host("shop", &[("app", "backend")]);
        let peer = cluster_host("shop", &[("app", "frontend")]);
        let rule = Rule {
            concerns: affected.clone(),
            direction: Direction::Incoming,
            connections: vec![Connection { from: peer.clone(), to: affected.clone(), on_port: PortSpec::Number(80) }],
        };
        let namespaces = vec!["shop".to_string()];
        let cases = TestCaseGenerator::generate(&[rule], &namespaces, &no_namespace_labels);
        let positive: Vec<_> = cases.iter().filter(|c| c.should_connect).collect();
        assert_eq!(positive.len(), 1);
        assert_eq!(positive[0].on_port, PortSpec::Number(80));
    }

    #[test]
    fn outgoing_rules_produce_no_negative_cases() {
        let affected = cluster_host("shop", &[("app", "backend")]);
        let peer = cluster_host("shop", &[("app", "db")]);
        let rule = Rule {
            concerns: affected.clone(),
            direction: Direction::Outgoing,
            connections: vec![Connection { from: affected.clone(), to: peer.clone(), on_port: PortSpec::Number(5432) }],
        };
        let namespaces = vec!["shop".to_string()];
        let cases = TestCaseGenerator::generate(&[rule], &namespaces, &no_namespace_labels);
        assert_eq!(cases.len(), 1);
        assert!(cases[0].should_connect);
    }

    #[test]
    fn isolated_host_with_no_reaching_hosts_gets_self_deny_case() {
        let affected = cluster_host("shop", &[("app", "vault")]);
        let rule = Rule { concerns: affected.clone(), direction: Direction::Incoming, connections: vec![] };
        let namespaces = vec!["shop".to_string()];
        let cases = TestCaseGenerator::generate(&[rule], &namespaces, &no_namespace_labels);
        assert_eq!(cases.len(), 1);
        assert!(!cases[0].should_connect);
        assert_eq!(cases[0].from, affected);
        assert_eq!(cases[0].to, affected);
        assert_eq!(cases[0].on_port, PortSpec::Wildcard);
    }

    #[test]
    fn default_deny_policy_in_default_namespace_matches_s1() {
        let affected = Host::ClusterHost { namespace: "default".to_string(), pod_labels: LabelMap::new() };
        let rule = Rule { concerns: affected.clone(), direction: Direction::Incoming, connections: vec![] };
        let cases = TestCaseGenerator::generate(&[rule], &["default".to_string()], &no_namespace_labels);
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].from.to_identifier(), "default:*");
        assert_eq!(cases[0].to.to_identifier(), "default:*");
        assert!(!cases[0].should_connect);
    }

    #[test]
    fn allow_all_ingress_matches_s2() {
        let affected = Host::ClusterHost { namespace: "default".to_string(), pod_labels: LabelMap::new() };
        let rule = Rule {
            concerns: affected.clone(),
            direction: Direction::Incoming,
            connections: vec![Connection { from: match_all(), to: affected.clone(), on_port: PortSpec::Wildcard }],
        };
        let cases = TestCaseGenerator::generate(&[rule], &["default".to_string()], &no_namespace_labels);
        assert_eq!(cases.len(), 1);
        assert!(cases[0].should_connect);
        assert_eq!(cases[0].from.to_identifier(), "*:*");
        assert_eq!(cases[0].to.to_identifier(), "default:*");
    }

    #[test]
    fn label_gated_ingress_matches_s3_shape() {
        let affected = Host::ClusterHost {
            namespace: "default".to_string(),
            pod_labels: [("app".to_string(), "web".to_string())].into_iter().collect(),
        };
        let peer = Host::ClusterHost {
            namespace: "default".to_string(),
            pod_labels: [("role".to_string(), "api".to_string())].into_iter().collect(),
        };
        let rule = Rule {
            concerns: affected.clone(),
            direction: Direction::Incoming,
            connections: vec![Connection { from: peer.clone(), to: affected.clone(), on_port: PortSpec::Wildcard }],
        };
        let cases = TestCaseGenerator::generate(&[rule], &["default".to_string()], &no_namespace_labels);
        let positives: Vec<_> = cases.iter().filter(|c| c.should_connect).collect();
        let negatives: Vec<_> = cases.iter().filter(|c| !c.should_connect).collect();
        assert_eq!(positives.len(), 1);
        assert_eq!(positives[0].from.to_identifier(), "default:role=api");
        // Three inversion forms, in the §4.3 order: ns-inverted,
        // both-inverted, labels-only-inverted.
        assert_eq!(negatives.len(), 3);
        assert_eq!(negatives[0].from.to_identifier(), "connprobe-inverted-default:role=api");
        assert_eq!(negatives[1].from.to_identifier(), "connprobe-inverted-default:connprobe-inverted-role=api");
        assert_eq!(negatives[2].from.to_identifier(), "default:connprobe-inverted-role=api");
        for n in &negatives {
            assert_eq!(n.to, affected);
        }
    }

    #[test]
    fn isolated_host_with_disjoint_reacher_gets_inverted_negative_cases() {
        let affected = cluster_host("shop", &[("app", "backend")]);
        let peer = cluster_host("shop", &[("app", "frontend")]);
        let rule = Rule {
            concerns: affected.clone(),
            direction: Direction::Incoming,
            connections: vec![Connection { from: peer.clone(), to: affected.clone(), on_port: PortSpec::Number(80) }],
        };
        let namespaces = vec!["shop".to_string()];
        let cases = TestCaseGenerator::generate(&[rule], &namespaces, &no_namespace_labels);
        let negatives: Vec<_> = cases.iter().filter(|c| !c.should_connect).collect();
        assert_eq!(negatives.len(), 3);
        for n in &negatives {
            assert_eq!(n.on_port, PortSpec::Number(80));
        }
    }

    #[test]
    fn match_all_reacher_with_wildcard_port_produces_no_negative_case() {
        let affected = cluster_host("shop", &[("app", "backend")]);
        let rule = Rule {
            concerns: affected.clone(),
            direction: Direction::Incoming,
            connections: vec![Connection { from: match_all(), to: affected.clone(), on_port: PortSpec::Wildcard }],
        };
        let namespaces = vec!["shop".to_string()];
        let cases = TestCaseGenerator::generate(&[rule], &namespaces, &no_namespace_labels);
        assert!(cases.iter().all(|c| c.should_connect));
    }

    #[test]
    fn match_all_reacher_with_numbered_port_produces_one_random_port_denial() {
        let affected = cluster_host("shop", &[("app", "backend")]);
        let rule = Rule {
            concerns: affected.clone(),
            direction: Direction::Incoming,
            connections: vec![Connection { from: match_all(), to: affected.clone(), on_port: PortSpec::Number(80) }],
        };
        let namespaces = vec!["shop".to_string()];
        let cases = TestCaseGenerator::generate(&[rule], &namespaces, &no_namespace_labels);
        let negatives: Vec<_> = cases.iter().filter(|c| !c.should_connect).collect();
        assert_eq!(negatives.len(), 1);
        assert_ne!(negatives[0].on_port, PortSpec::Number(80));
    }

    #[test]
    fn ip_block_only_ingress_still_isolates_with_self_deny() {
        // S5: an ingress entry with only a dropped IP-block peer leaves
        // zero connections, so the host is isolated exactly like an
        // empty-ingress policy.
        let affected = cluster_host("shop", &[("app", "vault")]);
        let rule = Rule { concerns: affected.clone(), direction: Direction::Incoming, connections: vec![] };
        let cases = TestCaseGenerator::generate(&[rule], &["shop".to_string()], &no_namespace_labels);
        assert_eq!(cases.len(), 1);
        assert!(!cases[0].should_connect);
        assert_eq!(cases[0].from, affected);
        assert_eq!(cases[0].to, affected);
    }

    #[test]
    fn output_order_is_outgoing_then_negatives_then_incoming() {
        let affected = cluster_host("shop", &[("app", "backend")]);
        let out_peer = cluster_host("shop", &[("app", "db")]);
        let in_peer = cluster_host("shop", &[("app", "frontend")]);
        let rules = vec![
            Rule {
                concerns: affected.clone(),
                direction: Direction::Outgoing,
                connections: vec![Connection { from: affected.clone(), to: out_peer.clone(), on_port: PortSpec::Number(5432) }],
            },
            Rule {
                concerns: affected.clone(),
                direction: Direction::Incoming,
                connections: vec![Connection { from: in_peer.clone(), to: affected.clone(), on_port: PortSpec::Number(80) }],
            },
        ];
        let cases = TestCaseGenerator::generate(&rules, &["shop".to_string()], &no_namespace_labels);
        assert!(cases[0].should_connect && cases[0].to == out_peer);
        assert!(!cases[1].should_connect);
        assert!(cases.last().unwrap().should_connect && cases.last().unwrap().from == in_peer);
    }
}
