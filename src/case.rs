//! `NetworkTestCase`, the signed port-string format, and the case-plan /
//! result-artifact shapes exchanged with the cluster as ConfigMaps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::host::{Host, PortSpec};

/// One synthesized positive or negative reachability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkTestCase {
    pub from: Host,
    pub to: Host,
    pub on_port: PortSpec,
    pub should_connect: bool,
}

impl NetworkTestCase {
    pub fn new(from: Host, to: Host, on_port: PortSpec, should_connect: bool) -> Self {
        Self { from, to, on_port, should_connect }
    }

    /// The port string keyed in both the case-plan and result artifacts:
    /// the port prefixed with `-` when the case expects the connection
    /// to be blocked.
    pub fn port_string(&self) -> String {
        if self.should_connect {
            self.on_port.to_string()
        } else {
            format!("-{}", self.on_port)
        }
    }

    /// Parse a port string back into `(PortSpec, should_connect)`.
    pub fn parse_port_string(s: &str) -> (PortSpec, bool) {
        if let Some(rest) = s.strip_prefix('-') {
            (PortSpec::parse(rest), false)
        } else {
            (PortSpec::parse(s), true)
        }
    }

    /// The string published in the case plan's port list: the original
    /// signed port string, plus (only when materialization actually
    /// rewrote the port, e.g. a wildcard resolved to a service's
    /// concrete port) the concrete port the runner should actually
    /// dial, joined by `@`. Runners key results by the part before
    /// `@`; they dial the part after it, or the bare string itself
    /// when no rewrite happened.
    pub fn wire_port_string(&self, rewritten: PortSpec) -> String {
        let original = self.port_string();
        if rewritten == self.on_port {
            original
        } else {
            format!("{original}@{rewritten}")
        }
    }

    /// Split a wire port string back into `(original_port_string,
    /// port_to_dial)`.
    pub fn parse_wire_port_string(s: &str) -> (String, PortSpec) {
        match s.split_once('@') {
            Some((original, dial)) => (original.to_string(), PortSpec::parse(dial)),
            None => {
                let (dial, _) = Self::parse_port_string(s);
                (s.to_string(), dial)
            }
        }
    }
}

/// The two-level `from -> to -> [port_string]` case-plan map serialized
/// as the `cases.yaml` key of a ConfigMap.
pub type CasePlan = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// Fold a single case into an existing plan, appending to (and
/// deduplicating within) the target's port-string list.
pub fn merge_in(plan: &mut CasePlan, case: &NetworkTestCase) {
    let port_string = case.port_string();
    let to_map = plan.entry(case.from.to_identifier()).or_default();
    let ports = to_map.entry(case.to.to_identifier()).or_default();
    if !ports.contains(&port_string) {
        ports.push(port_string);
    }
}

pub fn build_case_plan(cases: &[NetworkTestCase]) -> CasePlan {
    let mut plan = CasePlan::new();
    for case in cases {
        merge_in(&mut plan, case);
    }
    plan
}

/// Like [`merge_in`], but records the wire port string (original key
/// plus, if different, the concrete port to dial) produced by
/// materialization instead of the bare original port string.
pub fn merge_in_rewritten(plan: &mut CasePlan, case: &NetworkTestCase, rewritten_port: PortSpec) {
    let wire = case.wire_port_string(rewritten_port);
    let to_map = plan.entry(case.from.to_identifier()).or_default();
    let ports = to_map.entry(case.to.to_identifier()).or_default();
    if !ports.contains(&wire) {
        ports.push(wire);
    }
}

pub fn build_case_plan_from_materialized(materialized: &[(NetworkTestCase, PortSpec)]) -> CasePlan {
    let mut plan = CasePlan::new();
    for (case, rewritten) in materialized {
        merge_in_rewritten(&mut plan, case, *rewritten);
    }
    plan
}

/// Outcome of a single scanned port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nmap_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// `from -> to -> port_string -> PortResult`, as published by each
/// runner and merged by the collector.
pub type ResultMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, PortResult>>>;

/// The full artifact one runner (or the collector, after merging)
/// publishes: scan results plus an optional diagnostic runtime map.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResultArtifact {
    pub results: ResultMap,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub runtimes: Option<BTreeMap<String, String>>,
}

/// Merge `other` into `base`, assuming the two artifacts report on
/// disjoint sets of senders (no attempt is made to reconcile
/// conflicting entries for the same `from`/`to`/port).
pub fn merge_result_artifacts(base: &mut ResultArtifact, other: ResultArtifact) {
    for (from, to_map) in other.results {
        let base_to_map = base.results.entry(from).or_default();
        for (to, port_map) in to_map {
            let base_port_map = base_to_map.entry(to).or_default();
            for (port, result) in port_map {
                base_port_map.insert(port, result);
            }
        }
    }
    if let Some(other_runtimes) = other.runtimes {
        let base_runtimes = base.runtimes.get_or_insert_with(BTreeMap::new);
        base_runtimes.extend(other_runtimes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concrete(ns: &str, name: &str) -> Host {
        Host::ConcreteClusterHost { namespace: ns.to_string(), workload_name: name.to_string() }
    }

    #[test]
    fn port_string_is_signed_for_negative_cases() {
        let positive = NetworkTestCase::new(concrete("a", "p"), concrete("a", "q"), PortSpec::Number(80), true);
        let negative = NetworkTestCase::new(concrete("a", "p"), concrete("a", "q"), PortSpec::Number(80), false);
        assert_eq!(positive.port_string(), "80");
        assert_eq!(negative.port_string(), "-80");
    }

    #[test]
    fn parse_port_string_round_trips() {
        assert_eq!(NetworkTestCase::parse_port_string("443"), (PortSpec::Number(443), true));
        assert_eq!(NetworkTestCase::parse_port_string("-443"), (PortSpec::Number(443), false));
        assert_eq!(NetworkTestCase::parse_port_string("*"), (PortSpec::Wildcard, true));
    }

    #[test]
    fn wire_port_string_is_plain_when_port_unchanged() {
        let case = NetworkTestCase::new(concrete("a", "p"), concrete("a", "q"), PortSpec::Number(80), true);
        assert_eq!(case.wire_port_string(PortSpec::Number(80)), "80");
    }

    #[test]
    fn wire_port_string_encodes_rewritten_dial_port() {
        let case = NetworkTestCase::new(concrete("a", "p"), concrete("a", "q"), PortSpec::Wildcard, true);
        let wire = case.wire_port_string(PortSpec::Number(8080));
        assert_eq!(wire, "*@8080");
        let (original_key, dial) = NetworkTestCase::parse_wire_port_string(&wire);
        assert_eq!(original_key, "*");
        assert_eq!(dial, PortSpec::Number(8080));
    }

    #[test]
    fn merge_in_deduplicates_ports_for_same_pair() {
        let mut plan = CasePlan::new();
        let case1 = NetworkTestCase::new(concrete("a", "p"), concrete("b", "q"), PortSpec::Number(80), true);
        let case2 = NetworkTestCase::new(concrete("a", "p"), concrete("b", "q"), PortSpec::Number(80), true);
        let case3 = NetworkTestCase::new(concrete("a", "p"), concrete("b", "q"), PortSpec::Number(443), true);
        merge_in(&mut plan, &case1);
        merge_in(&mut plan, &case2);
        merge_in(&mut plan, &case3);
        let ports = &plan["a:p"]["b:q"];
        assert_eq!(ports, &vec!["80".to_string(), "443".to_string()]);
    }

    #[test]
    fn merge_result_artifacts_combines_disjoint_senders() {
        let mut base = ResultArtifact::default();
        base.results
            .entry("a:p".to_string())
            .or_default()
            .entry("b:q".to_string())
            .or_default()
            .insert("80".to_string(), PortResult { success: true, nmap_state: Some("open".to_string()), error: None });

        let mut other = ResultArtifact::default();
        other.results
            .entry("c:r".to_string())
            .or_default()
            .entry("b:q".to_string())
            .or_default()
            .insert("-80".to_string(), PortResult { success: false, nmap_state: Some("open".to_string()), error: None });

        merge_result_artifacts(&mut base, other);
        assert_eq!(base.results.len(), 2);
        assert!(base.results.contains_key("a:p"));
        assert!(base.results.contains_key("c:r"));
    }
}
