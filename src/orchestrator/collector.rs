//! P7: poll for each expected runner's per-node result ConfigMap, merge
//! them into one [`ResultArtifact`], and reverse-map the concrete
//! `from`/`to` identifiers the runners observed back onto the abstract
//! `Host` identifiers the case plan was built from.
//!
//! Grounded on the bounded-retry idiom in
//! `examples/MannanSaood-Sennet/agent/src/heartbeat.rs::send_heartbeat`;
//! tolerating `NotFound` while a runner hasn't published yet (but
//! treating any other API error as terminal) mirrors
//! `test_orchestrator.py`'s `_collect_results` handling of a runner pod
//! that never ran.

use std::collections::HashMap;
use std::time::Duration;

use backoff::{future::retry, Error as BackoffError, ExponentialBackoff};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use tracing::{debug, warn};

use super::Orchestrator;
use crate::case::{merge_result_artifacts, ResultArtifact};
use crate::error::{CollectorError, OrchestratorError};
use crate::host::Host;

const RESULTS_KEY: &str = "results";

pub async fn collect_results(
    orch: &Orchestrator,
    expected_runner_pods: &[String],
    reverse_map: &HashMap<String, Host>,
) -> Result<ResultArtifact, OrchestratorError> {
    let api: Api<ConfigMap> = Api::namespaced(orch.ctx.client.clone(), &orch.config.project_namespace);

    let backoff_config = ExponentialBackoff {
        initial_interval: Duration::from_secs(orch.config.result_collect_poll_interval_secs),
        max_interval: Duration::from_secs(orch.config.result_collect_poll_interval_secs * 4),
        max_elapsed_time: Some(Duration::from_secs(orch.config.result_collect_timeout_secs)),
        ..Default::default()
    };

    let merged = retry(backoff_config, || async {
        let mut merged = ResultArtifact::default();
        let mut missing = Vec::new();

        for pod_name in expected_runner_pods {
            let cm_name = format!("{pod_name}-results");
            match api.get(&cm_name).await {
                Ok(cm) => match parse_result_configmap(&cm) {
                    Ok(artifact) => merge_result_artifacts(&mut merged, artifact),
                    Err(e) => return Err(BackoffError::permanent(OrchestratorError::from(e))),
                },
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    missing.push(pod_name.clone());
                }
                Err(e) => return Err(BackoffError::permanent(OrchestratorError::from(e))),
            }
        }

        if missing.is_empty() {
            Ok(merged)
        } else {
            warn!(?missing, "still waiting on runner result ConfigMaps");
            Err(BackoffError::transient(OrchestratorError::from(CollectorError::Timeout { missing })))
        }
    })
    .await
    .map_err(|_| {
        OrchestratorError::from(CollectorError::Timeout {
            missing: expected_runner_pods.to_vec(),
        })
    })?;

    Ok(reverse_map_identifiers(merged, reverse_map))
}

fn parse_result_configmap(cm: &ConfigMap) -> Result<ResultArtifact, CollectorError> {
    let raw = cm
        .data
        .as_ref()
        .and_then(|d| d.get(RESULTS_KEY))
        .cloned()
        .unwrap_or_default();
    let artifact: ResultArtifact = serde_yaml::from_str(&raw)?;
    Ok(artifact)
}

/// Replace any concrete `namespace/pod:port` identifier the runner
/// observed with the abstract `Host` identifier it was materialized
/// from, wherever `reverse_map` has an entry for it. Identifiers with
/// no reverse-map entry (e.g. a sender that already satisfied an
/// existing selector rather than being newly created) pass through
/// unchanged.
fn reverse_map_identifiers(artifact: ResultArtifact, reverse_map: &HashMap<String, Host>) -> ResultArtifact {
    let resolve = |id: &str| -> String {
        reverse_map
            .get(id)
            .map(|h| h.to_identifier())
            .unwrap_or_else(|| id.to_string())
    };

    let mut results = crate::case::ResultMap::new();
    for (from, to_map) in artifact.results {
        let resolved_from = resolve(&from);
        let dest_to_map = results.entry(resolved_from).or_default();
        for (to, port_map) in to_map {
            let resolved_to = resolve(&to);
            dest_to_map.entry(resolved_to).or_default().extend(port_map);
        }
    }

    ResultArtifact { results, runtimes: artifact.runtimes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::PortResult;
    use crate::host::LabelMap;

    #[test]
    fn reverse_map_rewrites_known_identifiers() {
        let mut artifact = ResultArtifact::default();
        artifact
            .results
            .entry("default:connprobe-sender-abc123".to_string())
            .or_default()
            .entry("default:connprobe-target-def456".to_string())
            .or_default()
            .insert("80".to_string(), PortResult { success: true, nmap_state: Some("open".to_string()), error: None });

        let mut reverse_map = HashMap::new();
        reverse_map.insert(
            "default:connprobe-sender-abc123".to_string(),
            Host::GenericClusterHost {
                namespace_labels: LabelMap::new(),
                pod_labels: LabelMap::from([("app".to_string(), "frontend".to_string())]),
            },
        );

        let rewritten = reverse_map_identifiers(artifact, &reverse_map);
        assert!(rewritten.results.contains_key("*:app=frontend"));
        // Untracked identifiers pass through unchanged.
        assert!(rewritten.results["*:app=frontend"].contains_key("default:connprobe-target-def456"));
    }

    #[test]
    fn reverse_map_passes_through_unknown_identifiers() {
        let mut artifact = ResultArtifact::default();
        artifact
            .results
            .entry("default/existing-pod:*".to_string())
            .or_default()
            .entry("default/other-pod:80".to_string())
            .or_default()
            .insert("80".to_string(), PortResult { success: true, nmap_state: None, error: None });

        let reverse_map = HashMap::new();
        let rewritten = reverse_map_identifiers(artifact, &reverse_map);
        assert!(rewritten.results.contains_key("default/existing-pod:*"));
    }
}
