//! P5: idempotently ensure the ServiceAccount/ClusterRole/
//! ClusterRoleBinding the runner DaemonSet needs exist.
//!
//! Grounded on `test_orchestrator.py`'s
//! `_create_missing_service_accounts`/`_create_missing_cluster_role`/
//! `_create_missing_cluster_role_binding`: each resource is created only
//! if absent, and an existing binding's subjects are left untouched
//! rather than overwritten.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::Api;
use tracing::debug;

use super::Orchestrator;
use crate::error::OrchestratorError;
use crate::labels::{Role, CLEANUP_ALWAYS, CLEANUP_LABEL, ROLE_LABEL};

const SERVICE_ACCOUNT_NAME: &str = "connprobe-runner";
const CLUSTER_ROLE_NAME: &str = "connprobe-runner";
const CLUSTER_ROLE_BINDING_NAME: &str = "connprobe-runner";

pub async fn ensure_rbac(orch: &Orchestrator) -> Result<(), OrchestratorError> {
    ensure_service_account(orch).await?;
    ensure_cluster_role(orch).await?;
    ensure_cluster_role_binding(orch).await?;
    Ok(())
}

fn managed_labels(role: Role) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(CLEANUP_LABEL.to_string(), CLEANUP_ALWAYS.to_string());
    labels.insert(ROLE_LABEL.to_string(), role.as_str().to_string());
    labels
}

async fn ensure_service_account(orch: &Orchestrator) -> Result<(), OrchestratorError> {
    let api: Api<ServiceAccount> = Api::namespaced(orch.ctx.client.clone(), &orch.config.project_namespace);
    if api.get(SERVICE_ACCOUNT_NAME).await.is_ok() {
        return Ok(());
    }
    let sa = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(SERVICE_ACCOUNT_NAME.to_string()),
            namespace: Some(orch.config.project_namespace.clone()),
            labels: Some(managed_labels(Role::RunnerServiceAccount)),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&PostParams::default(), &sa).await {
        Ok(_) => debug!("created runner ServiceAccount"),
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn ensure_cluster_role(orch: &Orchestrator) -> Result<(), OrchestratorError> {
    let api: Api<ClusterRole> = Api::all(orch.ctx.client.clone());
    if api.get(CLUSTER_ROLE_NAME).await.is_ok() {
        return Ok(());
    }
    let role = ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.to_string()),
            labels: Some(managed_labels(Role::RunnerClusterRoleBinding)),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["namespaces".to_string(), "pods".to_string(), "services".to_string()]),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["configmaps".to_string()]),
                verbs: vec![
                    "get".to_string(),
                    "list".to_string(),
                    "watch".to_string(),
                    "create".to_string(),
                    "update".to_string(),
                    "patch".to_string(),
                ],
                ..Default::default()
            },
        ]),
        ..Default::default()
    };
    match api.create(&PostParams::default(), &role).await {
        Ok(_) => debug!("created runner ClusterRole"),
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn ensure_cluster_role_binding(orch: &Orchestrator) -> Result<(), OrchestratorError> {
    let api: Api<ClusterRoleBinding> = Api::all(orch.ctx.client.clone());
    if api.get(CLUSTER_ROLE_BINDING_NAME).await.is_ok() {
        // Leave any existing binding's subjects alone; connprobe only
        // adds its own ServiceAccount once, it does not reconcile drift.
        return Ok(());
    }
    let binding = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_BINDING_NAME.to_string()),
            labels: Some(managed_labels(Role::RunnerClusterRoleBinding)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT_NAME.to_string(),
            namespace: Some(orch.config.project_namespace.clone()),
            ..Default::default()
        }]),
    };
    match api.create(&PostParams::default(), &binding).await {
        Ok(_) => debug!("created runner ClusterRoleBinding"),
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_labels_carry_cleanup_and_role() {
        let labels = managed_labels(Role::RunnerServiceAccount);
        assert_eq!(labels.get(CLEANUP_LABEL).map(String::as_str), Some(CLEANUP_ALWAYS));
        assert_eq!(labels.get(ROLE_LABEL).map(String::as_str), Some(Role::RunnerServiceAccount.as_str()));
    }
}
