//! connprobe-runner - per-node probe agent
//!
//! One copy runs per node via the DaemonSet the orchestrator launches
//! in P6. Steps 1-7 of the per-node protocol: list local pods, restrict
//! the published case plan to the ones that appear as a sender on this
//! node, scan every target from inside each sender's network
//! namespace, and publish this node's result ConfigMap. Step 8 idles
//! the process afterward so it stays alive (and responsive to the
//! DaemonSet's termination signal) instead of exiting.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use connprobe::case::ResultArtifact;
use connprobe::error::RunnerError;
use connprobe::host::Host;
use connprobe::orchestrator::RuntimeFlavor;
use connprobe::runner::{
    fetch_case_plan, filter_plan_for_local_senders, local_sender_pods, publish_results, run_cases_for_sender, runtime,
    RunnerConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = read_runner_config().context("read runner configuration from environment")?;
    info!(node = %config.node_name, namespace = %config.project_namespace, "connprobe-runner starting");

    if let Err(e) = run(&config).await {
        error!("connprobe-runner run failed: {}", e);
        return Err(e);
    }

    info!("connprobe-runner finished its pass, idling");
    idle_forever().await
}

fn read_runner_config() -> Result<RunnerConfig> {
    let node_name = std::env::var("NODE_NAME").context("NODE_NAME must be set by the downward API")?;
    let project_namespace =
        std::env::var("CONNPROBE_PROJECT_NAMESPACE").unwrap_or_else(|_| connprobe::labels::PROJECT_NAMESPACE.to_string());

    let flavor_str = std::env::var("CONNPROBE_RUNTIME_FLAVOR").unwrap_or_default();
    let runtime_flavor = match flavor_str.as_str() {
        "cri" => RuntimeFlavor::Cri,
        "docker" => RuntimeFlavor::Docker,
        other => return Err(RunnerError::UnsupportedRuntime(other.to_string()).into()),
    };

    Ok(RunnerConfig { node_name, project_namespace, runtime_flavor })
}

async fn run(config: &RunnerConfig) -> Result<()> {
    let runner_pod_name = std::env::var("POD_NAME").context("POD_NAME must be set by the downward API")?;
    let client = Client::try_default().await.context("connect to the cluster")?;

    let plan = fetch_case_plan(&client, &config.project_namespace)
        .await
        .context("fetch published case plan")?;

    let local_pods = local_sender_pods(&client, config).await.context("list local pods")?;
    let local_identifiers: Vec<String> = local_pods
        .iter()
        .filter_map(|p| {
            let name = p.metadata.name.clone()?;
            let namespace = p.metadata.namespace.clone()?;
            Some(Host::ConcreteClusterHost { namespace, workload_name: name }.to_identifier())
        })
        .collect();

    let local_plan = filter_plan_for_local_senders(&plan, &local_identifiers);
    info!(senders = local_plan.len(), "restricted case plan to local senders");

    let mut artifact = ResultArtifact::default();

    for (sender_identifier, targets) in &local_plan {
        let sender_pod = match find_pod_by_identifier(&local_pods, sender_identifier) {
            Some(p) => p,
            None => {
                warn!(sender = %sender_identifier, "local sender identifier did not match any listed pod, skipping");
                continue;
            }
        };
        let (namespace, pod_name) = match (sender_pod.metadata.namespace.as_deref(), sender_pod.metadata.name.as_deref()) {
            (Some(ns), Some(name)) => (ns, name),
            _ => continue,
        };

        let sender_pid = match runtime::resolve_container_pid(config.runtime_flavor, namespace, pod_name) {
            Ok(pid) => pid,
            Err(e) => {
                warn!(sender = %sender_identifier, error = %e, "failed to resolve sender's container PID, skipping its cases");
                continue;
            }
        };

        let target_ips = resolve_target_ips(&client, targets).await;

        let (sender_results, sender_runtimes) =
            run_cases_for_sender(config, sender_identifier, sender_pid, targets, &target_ips)?;
        artifact.results.insert(sender_identifier.clone(), sender_results);
        artifact.runtimes.get_or_insert_with(BTreeMap::new).extend(sender_runtimes);
    }

    publish_results(&client, config, &runner_pod_name, &artifact)
        .await
        .context("publish result ConfigMap")?;

    Ok(())
}

/// Find the listed pod matching a `ConcreteClusterHost` identifier
/// (`namespace:pod-name`).
fn find_pod_by_identifier<'a>(pods: &'a [Pod], identifier: &str) -> Option<&'a Pod> {
    let (namespace, name) = identifier.split_once(':')?;
    pods.iter().find(|p| {
        p.metadata.namespace.as_deref() == Some(namespace) && p.metadata.name.as_deref() == Some(name)
    })
}

/// Fetch each target's pod IP by parsing its concrete `ConcreteClusterHost`
/// identifier and reading the pod directly from the API. Targets whose
/// identifier doesn't parse, or whose pod has no IP yet, are simply
/// absent from the returned map; [`run_cases_for_sender`] records a
/// per-port failure for those.
async fn resolve_target_ips(client: &Client, targets: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, String> {
    let mut ips = BTreeMap::new();
    for target_identifier in targets.keys() {
        let host = match Host::from_identifier(target_identifier) {
            Ok(h) => h,
            Err(e) => {
                warn!(target = %target_identifier, error = %e, "could not parse target identifier");
                continue;
            }
        };
        let Host::ConcreteClusterHost { namespace, workload_name } = host else {
            warn!(target = %target_identifier, "target did not resolve to a concrete pod identifier");
            continue;
        };

        let pods_api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        match pods_api.get(&workload_name).await {
            Ok(pod) => match pod.status.as_ref().and_then(|s| s.pod_ip.clone()) {
                Some(ip) => {
                    ips.insert(target_identifier.clone(), ip);
                }
                None => warn!(target = %target_identifier, "target pod has no IP address yet"),
            },
            Err(e) => warn!(target = %target_identifier, error = %e, "failed to fetch target pod"),
        }
    }
    ips
}

/// Step 8: idle indefinitely once this pass is done. The DaemonSet
/// keeps the process running between orchestrator invocations; it never
/// exits on its own, only on SIGTERM when the DaemonSet is torn down.
async fn idle_forever() -> ! {
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
