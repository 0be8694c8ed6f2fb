//! P2/P3: resolve abstract hosts to concrete cluster resources, create
//! dummy senders/targets where nothing already satisfies a selector, and
//! rewrite symbolic ports to the concrete ports a probe will actually
//! dial.

use std::collections::{BTreeMap, HashMap, HashSet};

use k8s_openapi::api::core::v1::{
    Container, Namespace, Pod, PodSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Patch, PatchParams, PostParams};
use tracing::debug;

use super::Orchestrator;
use crate::case::{CasePlan, NetworkTestCase};
use crate::error::{CaseError, OrchestratorError};
use crate::host::{Host, PortSpec};
use crate::labels::{random_port_excluding, Role, CLEANUP_ALWAYS, CLEANUP_LABEL, ROLE_LABEL};

/// A test case after its hosts have been resolved to the concrete pod
/// each side will actually run as, and its port rewritten for the
/// actual scan.
///
/// `resolved_from`/`resolved_to` are always `Host::ConcreteClusterHost`
/// once `error` is `None` - the runner matches senders to its own node
/// by literal `ConcreteClusterHost` identity, never by re-evaluating a
/// selector.
#[derive(Debug, Clone)]
pub struct MaterializedCase {
    pub case: NetworkTestCase,
    pub resolved_from: Host,
    pub resolved_to: Host,
    pub rewritten_port: PortSpec,
    pub error: Option<CaseError>,
}

pub async fn materialize_cases(
    orch: &mut Orchestrator,
    cases: &[NetworkTestCase],
) -> Result<Vec<MaterializedCase>, OrchestratorError> {
    let mut out = Vec::with_capacity(cases.len());

    for case in cases {
        if matches!(case.from, Host::LocalHost | Host::ExternalHost(_)) {
            out.push(MaterializedCase {
                case: case.clone(),
                resolved_from: case.from.clone(),
                resolved_to: case.to.clone(),
                rewritten_port: case.on_port,
                error: Some(CaseError::UnsupportedSender(
                    "LocalHost/ExternalHost senders have no in-cluster materialization".to_string(),
                )),
            });
            continue;
        }

        let resolved_from = resolve_sender(orch, &case.from).await?;
        let resolved_to = resolve_target(orch, &case.to, case.on_port).await?;
        let rewritten = rewrite_port_for_host(orch, &case.to, case.on_port, case.should_connect).await?;

        out.push(MaterializedCase {
            case: case.clone(),
            resolved_from,
            resolved_to,
            rewritten_port: rewritten.unwrap_or(case.on_port),
            error: if rewritten.is_none() && case.should_connect {
                Some(CaseError::MissingPort)
            } else {
                None
            },
        });
    }

    Ok(out)
}

/// Resolve a sender selector to the concrete pod it will run as: an
/// existing pod already satisfying the selector if one exists, else a
/// freshly created dummy sender pod (and namespace, if needed).
async fn resolve_sender(orch: &mut Orchestrator, host: &Host) -> Result<Host, OrchestratorError> {
    if let Host::ConcreteClusterHost { .. } = host {
        return Ok(host.clone());
    }

    let namespace = match host {
        Host::ClusterHost { namespace, .. } => namespace.clone(),
        Host::GenericClusterHost { .. } => "default".to_string(),
        _ => unreachable!("LocalHost/ExternalHost senders are filtered out before materialization"),
    };

    let pod_labels = host.pod_labels().cloned().unwrap_or_default();
    if let Some(existing) = orch
        .snapshot
        .pods
        .iter()
        .find(|p| p.namespace == namespace && pod_labels.iter().all(|(k, v)| p.labels.get(k) == Some(v)))
    {
        return Ok(Host::ConcreteClusterHost { namespace, workload_name: existing.name.clone() });
    }

    ensure_namespace_exists(orch, &namespace).await?;

    let pod_name = format!("connprobe-sender-{}", short_id());
    let mut labels: BTreeMap<String, String> = pod_labels.into_iter().collect();
    labels.insert(CLEANUP_LABEL.to_string(), CLEANUP_ALWAYS.to_string());
    labels.insert(ROLE_LABEL.to_string(), Role::SenderPod.as_str().to_string());

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "connprobe-sender".to_string(),
                image: Some(orch.config.target_image.clone()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    };

    let pods_api = orch.ctx.pods_api(&namespace);
    match pods_api.create(&PostParams::default(), &pod).await {
        Ok(_) => debug!(pod = %pod_name, namespace = %namespace, "created dummy sender pod"),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(pod = %pod_name, "sender pod already exists, reusing");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Host::ConcreteClusterHost { namespace, workload_name: pod_name })
}

async fn ensure_namespace_exists(orch: &Orchestrator, namespace: &str) -> Result<(), OrchestratorError> {
    if orch.snapshot.namespaces.iter().any(|n| n.name == namespace) {
        return Ok(());
    }

    let mut labels = BTreeMap::new();
    labels.insert(CLEANUP_LABEL.to_string(), CLEANUP_ALWAYS.to_string());
    labels.insert(ROLE_LABEL.to_string(), Role::SenderNamespace.as_str().to_string());

    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: None,
        status: None,
    };

    let ns_api = orch.ctx.namespaces_api();
    match ns_api.create(&PostParams::default(), &ns).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(e) => return Err(e.into()),
    }

    // Give the namespace's default ServiceAccount a moment to be
    // admitted; pods created immediately after namespace creation can
    // otherwise fail to mount a token volume on some clusters.
    use backoff::{future::retry, ExponentialBackoff};
    let sa_api: kube::Api<k8s_openapi::api::core::v1::ServiceAccount> =
        kube::Api::namespaced(orch.ctx.client.clone(), namespace);
    let backoff_config = ExponentialBackoff {
        max_elapsed_time: Some(std::time::Duration::from_secs(15)),
        ..Default::default()
    };
    let _ = retry(backoff_config, || async {
        sa_api
            .get("default")
            .await
            .map_err(|e| backoff::Error::transient(e))
    })
    .await;

    Ok(())
}

/// Resolve a target selector to the concrete pod a probe will dial: an
/// existing pod whose namespace already exposes the requested port via
/// some `Service`, else a freshly created dummy target pod + service.
/// Only a numbered target port is materialized this way; a wildcard
/// target without a service is left for `rewrite_port_for_host` to
/// reject as `CaseError::MissingPort` (nothing sensible to listen on
/// for "any port").
async fn resolve_target(orch: &mut Orchestrator, host: &Host, on_port: PortSpec) -> Result<Host, OrchestratorError> {
    if let Host::ConcreteClusterHost { .. } = host {
        return Ok(host.clone());
    }

    let namespace = match host {
        Host::ClusterHost { namespace, .. } => namespace.clone(),
        Host::GenericClusterHost { .. } => "default".to_string(),
        _ => unreachable!("LocalHost/ExternalHost targets are filtered out before materialization"),
    };

    let pod_labels: BTreeMap<String, String> = host.pod_labels().cloned().unwrap_or_default().into_iter().collect();

    let PortSpec::Number(port) = on_port else {
        // No concrete port to match an existing service against; fall
        // back to any pod already satisfying the selector, or a fresh
        // dummy if none exists - rewrite_port_for_host decides
        // separately whether this is fatal.
        if let Some(existing) = orch
            .snapshot
            .pods
            .iter()
            .find(|p| p.namespace == namespace && pod_labels.iter().all(|(k, v)| p.labels.get(k) == Some(v)))
        {
            return Ok(Host::ConcreteClusterHost { namespace, workload_name: existing.name.clone() });
        }
        return create_dummy_target(orch, &namespace, pod_labels, 0).await;
    };

    let already_exposed = orch
        .snapshot
        .services
        .get(&namespace)
        .map(|svcs| {
            svcs.iter()
                .flat_map(|s| s.spec.as_ref().and_then(|sp| sp.ports.clone()).unwrap_or_default())
                .any(|p| target_port_value(&p) == Some(port))
        })
        .unwrap_or(false);

    if already_exposed {
        if let Some(existing) = orch
            .snapshot
            .pods
            .iter()
            .find(|p| p.namespace == namespace && pod_labels.iter().all(|(k, v)| p.labels.get(k) == Some(v)))
        {
            return Ok(Host::ConcreteClusterHost { namespace, workload_name: existing.name.clone() });
        }
    }

    create_dummy_target(orch, &namespace, pod_labels, port).await
}

async fn create_dummy_target(
    orch: &mut Orchestrator,
    namespace: &str,
    pod_labels: BTreeMap<String, String>,
    port: u16,
) -> Result<Host, OrchestratorError> {
    ensure_namespace_exists(orch, namespace).await?;

    let suffix = short_id();
    let pod_name = format!("connprobe-target-{suffix}");
    let svc_name = format!("connprobe-target-svc-{suffix}");

    let mut full_labels = pod_labels.clone();
    full_labels.insert(CLEANUP_LABEL.to_string(), CLEANUP_ALWAYS.to_string());
    full_labels.insert(ROLE_LABEL.to_string(), Role::TargetPod.as_str().to_string());

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(full_labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "connprobe-target".to_string(),
                image: Some(orch.config.target_image.clone()),
                ports: if port == 0 {
                    None
                } else {
                    Some(vec![k8s_openapi::api::core::v1::ContainerPort {
                        container_port: port as i32,
                        ..Default::default()
                    }])
                },
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    };

    let pods_api = orch.ctx.pods_api(namespace);
    match pods_api.create(&PostParams::default(), &pod).await {
        Ok(_) => debug!(pod = %pod_name, "created dummy target pod"),
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(e) => return Err(e.into()),
    }

    if port != 0 {
        let svc = dummy_service(&svc_name, namespace, pod_labels, port);
        let svc_api = orch.ctx.services_api(namespace);
        match svc_api.create(&PostParams::default(), &svc).await {
            Ok(_) => debug!(service = %svc_name, "created dummy target service"),
            Err(kube::Error::Api(e)) if e.code == 409 => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Host::ConcreteClusterHost { namespace: namespace.to_string(), workload_name: pod_name })
}

/// A `Service`'s `targetPort`, resolved to the numeric value actually
/// compared against a case's requested port. An unset `targetPort`
/// defaults to `port` per Kubernetes semantics; a symbolic (named)
/// `targetPort` is never resolved (resolving named ports against
/// container specs is an explicit non-goal - best-effort string match
/// only, which here means "never matches").
fn target_port_value(p: &ServicePort) -> Option<u16> {
    match &p.target_port {
        None => Some(p.port as u16),
        Some(IntOrString::Int(v)) => Some(*v as u16),
        Some(IntOrString::String(_)) => None,
    }
}

/// Resolve the concrete port a probe should actually dial for `to`.
///
/// - a wildcard port on a target that resolves to an existing `Service`
///   is rewritten to that service's port.
/// - a concrete numbered port is kept if some service in the target's
///   namespace exposes it as a `targetPort`, rewritten to that
///   service's `port` (§4.4: "resolves to the service port whose
///   `targetPort == p`").
/// - otherwise, for a *negative* expectation, a fresh port guaranteed not
///   to collide with any port the target's services expose is chosen.
/// - for a *positive* expectation with no mapping at all, `None` is
///   returned and the caller records `CaseError::MissingPort`.
async fn rewrite_port_for_host(
    orch: &Orchestrator,
    host: &Host,
    on_port: PortSpec,
    should_connect: bool,
) -> Result<Option<PortSpec>, OrchestratorError> {
    let namespace = match host {
        Host::ConcreteClusterHost { namespace, .. } | Host::ClusterHost { namespace, .. } => namespace.clone(),
        Host::GenericClusterHost { .. } => "default".to_string(),
        Host::LocalHost | Host::ExternalHost(_) => return Ok(Some(on_port)),
    };

    let services = orch.snapshot.services.get(&namespace).cloned().unwrap_or_default();
    let service_ports: Vec<ServicePort> = services
        .iter()
        .filter_map(|s| s.spec.as_ref())
        .flat_map(|spec| spec.ports.clone().unwrap_or_default())
        .collect();

    let exposed_ports: HashSet<u16> = service_ports.iter().map(|p| p.port as u16).collect();
    let target_port_to_service_port: HashMap<u16, u16> = service_ports
        .iter()
        .filter_map(|p| target_port_value(p).map(|t| (t, p.port as u16)))
        .collect();

    rewrite_port(on_port, should_connect, &target_port_to_service_port, &exposed_ports)
}

/// The pure decision behind port rewriting (§4.4 "Port rewriting"),
/// split out from [`rewrite_port_for_host`] so it can be exercised
/// without a live cluster snapshot (S6, Testable Properties §8):
///
/// - a wildcard on a target that exposes at least one service port
///   rewrites to that port (the first, by `HashSet`'s arbitrary but
///   stable-for-a-given-set iteration).
/// - a wildcard on a target with no exposed ports at all resolves to
///   `None` for a positive case (nothing to dial) or a fresh random
///   port for a negative one (no port is reachable, so any port proves
///   the point).
/// - a concrete port matching some service's `targetPort` rewrites to
///   that service's `port`.
/// - a concrete port matching no service's `targetPort` resolves to
///   `None` for a positive case (`CaseError::MissingPort`) or is kept
///   unchanged for a negative one - it's already unreachable by
///   construction, so probing it verbatim is correct.
fn rewrite_port(
    on_port: PortSpec,
    should_connect: bool,
    target_port_to_service_port: &HashMap<u16, u16>,
    exposed_ports: &HashSet<u16>,
) -> Result<Option<PortSpec>, OrchestratorError> {
    match on_port {
        PortSpec::Wildcard => {
            if let Some(port) = exposed_ports.iter().next() {
                Ok(Some(PortSpec::Number(*port)))
            } else if should_connect {
                Ok(None)
            } else {
                let port = random_port_excluding(exposed_ports).map_err(OrchestratorError::PortExhausted)?;
                Ok(Some(PortSpec::Number(port)))
            }
        }
        PortSpec::Number(n) => {
            if let Some(service_port) = target_port_to_service_port.get(&n) {
                Ok(Some(PortSpec::Number(*service_port)))
            } else if should_connect {
                Ok(None)
            } else {
                // A negative expectation against a port nothing exposes
                // is already "blocked by construction"; keep the
                // originally requested port.
                Ok(Some(PortSpec::Number(n)))
            }
        }
    }
}

pub async fn publish_case_plan_configmap(orch: &Orchestrator, plan: &CasePlan) -> Result<(), OrchestratorError> {
    use k8s_openapi::api::core::v1::ConfigMap;

    let cases_yaml = serde_yaml::to_string(plan)?;
    let mut data = BTreeMap::new();
    data.insert("cases.yaml".to_string(), cases_yaml);

    let mut labels = BTreeMap::new();
    labels.insert(CLEANUP_LABEL.to_string(), CLEANUP_ALWAYS.to_string());
    labels.insert(ROLE_LABEL.to_string(), Role::CasePlanConfigMap.as_str().to_string());

    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some("connprobe-cases".to_string()),
            namespace: Some(orch.config.project_namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };

    let cm_api: kube::Api<ConfigMap> = kube::Api::namespaced(orch.ctx.client.clone(), &orch.config.project_namespace);
    match cm_api.get(cm.metadata.name.as_ref().unwrap()).await {
        Ok(_) => {
            cm_api
                .patch(
                    cm.metadata.name.as_ref().unwrap(),
                    &PatchParams::apply("connprobe"),
                    &Patch::Merge(&cm),
                )
                .await?;
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            cm_api.create(&PostParams::default(), &cm).await?;
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

fn short_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

fn svc_port(port: u16) -> ServicePort {
    ServicePort {
        port: port as i32,
        target_port: Some(IntOrString::Int(port as i32)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn svc_spec(selector: BTreeMap<String, String>, port: u16) -> ServiceSpec {
    ServiceSpec {
        selector: Some(selector),
        ports: Some(vec![svc_port(port)]),
        ..Default::default()
    }
}

fn dummy_service(name: &str, namespace: &str, selector: BTreeMap<String, String>, port: u16) -> Service {
    let mut labels = selector.clone();
    labels.insert(CLEANUP_LABEL.to_string(), CLEANUP_ALWAYS.to_string());
    labels.insert(ROLE_LABEL.to_string(), Role::TargetService.as_str().to_string());
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(svc_spec(selector, port)),
        status: None,
    }
}
