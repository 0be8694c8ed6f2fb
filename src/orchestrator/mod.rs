//! The orchestrator drives phases P1-P7: refresh the cluster snapshot,
//! materialize sender/target resources, publish the case plan, ensure
//! RBAC, launch the runner DaemonSet, and collect results.
//!
//! Logically single-threaded: every method suspends at cluster-API
//! calls and the two explicit bounded-retry polling loops (daemon
//! readiness, result collection) rather than spawning concurrent work
//! of its own.

mod collector;
mod daemon;
mod materialize;
mod rbac;

use std::collections::HashMap;

use tracing::info;

use crate::case::{build_case_plan_from_materialized, CasePlan, NetworkTestCase, ResultArtifact};
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::generator::TestCaseGenerator;
use crate::host::Host;
use crate::k8s::{ClusterSnapshot, K8sContext};
use crate::rule::Rule;

pub use daemon::RuntimeFlavor;
pub use materialize::MaterializedCase;

pub struct Orchestrator {
    pub ctx: K8sContext,
    pub config: Config,
    pub snapshot: ClusterSnapshot,
}

impl Orchestrator {
    pub async fn connect(config: Config) -> Result<Self, OrchestratorError> {
        let ctx = K8sContext::connect().await?;
        let snapshot = ctx.fetch_snapshot().await?;
        Ok(Self { ctx, config, snapshot })
    }

    /// P1: re-list every cluster resource the rest of the run depends
    /// on.
    pub async fn refresh(&mut self) -> Result<(), OrchestratorError> {
        info!("refreshing cluster snapshot");
        self.snapshot = self.ctx.fetch_snapshot().await?;
        info!(
            pods = self.snapshot.pods.len(),
            namespaces = self.snapshot.namespaces.len(),
            policies = self.snapshot.policies.len(),
            "cluster snapshot refreshed"
        );
        Ok(())
    }

    /// Translate every NetworkPolicy in the snapshot into rules, then
    /// derive the full set of positive/negative test cases.
    pub fn build_test_cases(&self) -> Result<Vec<NetworkTestCase>, OrchestratorError> {
        let mut rules: Vec<Rule> = Vec::new();
        for policy in &self.snapshot.policies {
            rules.extend(Rule::from_network_policy(policy)?);
        }

        let namespaces = self.snapshot.namespace_names();
        let snapshot = &self.snapshot;
        let resolve = move |ns: &str| snapshot.namespace_labels(ns);
        Ok(TestCaseGenerator::generate(&rules, &namespaces, &resolve))
    }

    /// P2/P3: resolve every case's abstract hosts to concrete in-cluster
    /// resources, creating dummy senders/targets as needed and rewriting
    /// symbolic ports.
    pub async fn materialize_cases(
        &mut self,
        cases: &[NetworkTestCase],
    ) -> Result<Vec<MaterializedCase>, OrchestratorError> {
        materialize::materialize_cases(self, cases).await
    }

    /// P4: publish the two-level case plan as a ConfigMap, keyed by the
    /// concrete pod each side resolved to rather than the abstract
    /// selector it came from. Each case's port is recorded as its wire
    /// port string, so a wildcard rewritten to a concrete service port
    /// still dials the right port while the result stays keyed under
    /// the original port string. Cases that failed to materialize
    /// (`MaterializedCase::error`) are dropped from the plan.
    pub async fn publish_case_plan(&self, materialized: &[MaterializedCase]) -> Result<CasePlan, OrchestratorError> {
        let pairs: Vec<(NetworkTestCase, crate::host::PortSpec)> = materialized
            .iter()
            .filter(|m| m.error.is_none())
            .map(|m| {
                let resolved = NetworkTestCase::new(
                    m.resolved_from.clone(),
                    m.resolved_to.clone(),
                    m.case.on_port,
                    m.case.should_connect,
                );
                (resolved, m.rewritten_port)
            })
            .collect();
        let plan = build_case_plan_from_materialized(&pairs);
        materialize::publish_case_plan_configmap(self, &plan).await?;
        Ok(plan)
    }

    /// Build the `concrete identifier -> abstract Host` map P7 uses to
    /// translate each runner's concrete `from`/`to` identifiers back
    /// onto the selectors the case plan was generated from.
    pub fn build_reverse_map(materialized: &[MaterializedCase]) -> HashMap<String, Host> {
        let mut reverse_map = HashMap::new();
        for m in materialized {
            if m.error.is_some() {
                continue;
            }
            reverse_map.insert(m.resolved_from.to_identifier(), m.case.from.clone());
            reverse_map.insert(m.resolved_to.to_identifier(), m.case.to.clone());
        }
        reverse_map
    }

    /// P5: idempotently ensure the runner's RBAC objects exist.
    pub async fn ensure_rbac(&self) -> Result<(), OrchestratorError> {
        rbac::ensure_rbac(self).await
    }

    /// P6: launch (or reuse) the runner DaemonSet and wait for it to
    /// become ready.
    pub async fn launch_runners(&self) -> Result<Vec<String>, OrchestratorError> {
        daemon::launch_runners(self).await
    }

    /// P7: poll for and merge every expected runner's result ConfigMap,
    /// reverse-mapping concrete identifiers back to the abstract `Host`
    /// identifiers used in the original case plan.
    pub async fn collect_results(
        &self,
        expected_runner_pods: &[String],
        reverse_map: &HashMap<String, Host>,
    ) -> Result<ResultArtifact, OrchestratorError> {
        collector::collect_results(self, expected_runner_pods, reverse_map).await
    }
}
