//! connprobe - NetworkPolicy connectivity-probe orchestrator
//!
//! Drives phases P1-P7: refresh the cluster snapshot, translate
//! NetworkPolicies into rules, generate positive/negative test cases,
//! materialize senders/targets, publish the case plan, ensure RBAC,
//! launch the runner DaemonSet, and collect + report results.

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use connprobe::config::Config;
use connprobe::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("connprobe starting");

    let config = match Config::load() {
        Ok(cfg) => {
            info!(path = %cfg.config_path().display(), "configuration loaded");
            cfg
        }
        Err(e) => {
            error!("failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let result = run(config).await;
    match &result {
        Ok(all_passed) if *all_passed => info!("connprobe run complete: all cases matched expectations"),
        Ok(_) => warn!("connprobe run complete: some cases did not match expectations"),
        Err(e) => error!("connprobe run failed: {}", e),
    }

    match result {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => Err(e),
    }
}

/// Run every phase to completion and report whether every case's
/// observed outcome matched its expectation.
async fn run(config: Config) -> Result<bool> {
    let mut orchestrator = Orchestrator::connect(config).await.context("P1: connect to cluster")?;

    info!("P1: refreshing cluster snapshot");
    orchestrator.refresh().await.context("P1: refresh cluster snapshot")?;

    info!("P1: translating NetworkPolicies and generating test cases");
    let cases = orchestrator.build_test_cases().context("P1: build test cases")?;
    info!(cases = cases.len(), "generated test cases");

    info!("P2/P3: materializing senders and targets");
    let materialized = orchestrator
        .materialize_cases(&cases)
        .await
        .context("P2/P3: materialize cases")?;
    let failed = materialized.iter().filter(|m| m.error.is_some()).count();
    if failed > 0 {
        warn!(failed, "some cases could not be materialized and will be skipped");
    }

    info!("P4: publishing case plan");
    orchestrator
        .publish_case_plan(&materialized)
        .await
        .context("P4: publish case plan")?;
    let reverse_map = Orchestrator::build_reverse_map(&materialized);

    info!("P5: ensuring runner RBAC");
    orchestrator.ensure_rbac().await.context("P5: ensure RBAC")?;

    info!("P6: launching runner DaemonSet");
    let expected_runner_pods = orchestrator.launch_runners().await.context("P6: launch runners")?;
    info!(runners = expected_runner_pods.len(), "runner DaemonSet ready");

    info!("P7: collecting results");
    let artifact = orchestrator
        .collect_results(&expected_runner_pods, &reverse_map)
        .await
        .context("P7: collect results")?;

    let report = serde_yaml::to_string(&artifact).context("serialize result report")?;
    println!("{report}");

    let all_passed = artifact
        .results
        .values()
        .flat_map(|to_map| to_map.values())
        .flat_map(|port_map| port_map.values())
        .all(|result| result.success);

    Ok(all_passed)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
