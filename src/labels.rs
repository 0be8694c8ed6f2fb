//! Reserved label/constant vocabulary shared by every component.
//!
//! Renamed from the upstream project's own prefix, semantics kept.

use rand::Rng;
use std::collections::HashSet;

pub const PROJECT_PREFIX: &str = "connprobe";
pub const PROJECT_NAMESPACE: &str = "connprobe-system";
pub const DAEMONSET_NAME: &str = "connprobe-runner";

/// Label marking every object connprobe creates for later cleanup.
pub const CLEANUP_LABEL: &str = "connprobe-cleanup";
/// Label naming what role an object plays in a run.
pub const ROLE_LABEL: &str = "connprobe-role";
/// Prefix applied to an inverted host's pod/namespace label keys.
pub const INVERTED_ATTRIBUTE_PREFIX: &str = "connprobe-inverted-";

pub const CLEANUP_ALWAYS: &str = "always";
pub const CLEANUP_ON_REQUEST: &str = "on-request";

/// Fixed vocabulary for [`ROLE_LABEL`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    SenderPod,
    SenderNamespace,
    TargetPod,
    TargetService,
    RunnerDaemonSet,
    RunnerServiceAccount,
    RunnerClusterRoleBinding,
    CasePlanConfigMap,
    ResultConfigMap,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SenderPod => "sender-pod",
            Role::SenderNamespace => "sender-namespace",
            Role::TargetPod => "target-pod",
            Role::TargetService => "target-service",
            Role::RunnerDaemonSet => "runner-daemonset",
            Role::RunnerServiceAccount => "runner-service-account",
            Role::RunnerClusterRoleBinding => "runner-cluster-role-binding",
            Role::CasePlanConfigMap => "case-plan-configmap",
            Role::ResultConfigMap => "result-configmap",
        }
    }
}

/// Validate that a cleanup label value is one of the two known values.
pub fn validate_cleanup_label(value: &str) -> Result<(), String> {
    if value == CLEANUP_ALWAYS || value == CLEANUP_ON_REQUEST {
        Ok(())
    } else {
        Err(format!(
            "invalid {} value '{}', expected '{}' or '{}'",
            CLEANUP_LABEL, value, CLEANUP_ALWAYS, CLEANUP_ON_REQUEST
        ))
    }
}

/// Pick a random TCP port in `1..=65535` not present in `except_ports`.
///
/// Mirrors `illuminatio.util.rand_port`: errors out rather than looping
/// forever if every port is excluded.
pub fn random_port_excluding(except_ports: &HashSet<u16>) -> Result<u16, String> {
    if except_ports.len() >= 65535 {
        return Err("cannot choose a port: all ports are excluded".to_string());
    }
    let mut rng = rand::thread_rng();
    loop {
        let candidate: u16 = rng.gen_range(1..=65535);
        if !except_ports.contains(&candidate) {
            return Ok(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_cleanup_label_accepts_known_values() {
        assert!(validate_cleanup_label(CLEANUP_ALWAYS).is_ok());
        assert!(validate_cleanup_label(CLEANUP_ON_REQUEST).is_ok());
    }

    #[test]
    fn validate_cleanup_label_rejects_unknown() {
        assert!(validate_cleanup_label("sometimes").is_err());
    }

    #[test]
    fn random_port_excluding_avoids_excluded_set() {
        let mut except: HashSet<u16> = (1..=65535).collect();
        except.remove(&443);
        let port = random_port_excluding(&except).unwrap();
        assert_eq!(port, 443);
    }

    #[test]
    fn random_port_excluding_errors_when_all_excluded() {
        let except: HashSet<u16> = (0..=65535).collect();
        assert!(random_port_excluding(&except).is_err());
    }
}
