//! Invoke `nmap` against a target from inside a sender's network
//! namespace and parse its XML output into per-port results.
//!
//! No example repo in this pack parses nmap XML, so the wire format
//! itself is grounded on the real `nmaprun` schema; the
//! struct-per-element `quick-xml` `serde` mapping follows the same
//! "derive a struct that mirrors the wire shape" idiom the teacher
//! uses for Kubernetes API types throughout `src/k8s.rs`.

use std::process::Command;

use serde::Deserialize;

use crate::case::PortResult;
use crate::error::RunnerError;
use crate::host::PortSpec;

#[derive(Debug, Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<NmapHost>,
}

#[derive(Debug, Deserialize)]
struct NmapHost {
    #[serde(rename = "ports", default)]
    ports: Option<NmapPorts>,
}

#[derive(Debug, Deserialize)]
struct NmapPorts {
    #[serde(rename = "port", default)]
    port: Vec<NmapPort>,
}

#[derive(Debug, Deserialize)]
struct NmapPort {
    #[serde(rename = "@portid")]
    portid: u16,
    state: NmapState,
}

#[derive(Debug, Deserialize)]
struct NmapState {
    #[serde(rename = "@state")]
    state: String,
}

/// Run `nmap -n -Pn -p <ports> <target>` and classify each requested
/// port. `filtered` (nmap's term for "no response, presumed dropped by
/// a firewall") is the only state this project treats as blocked;
/// every other state (`open`, `closed`, `unfiltered`, ...) counts as
/// reachable, matching the generator's binary connect/no-connect model.
pub fn scan_ports(target_ip: &str, ports: &[PortSpec]) -> Result<Vec<(PortSpec, PortResult)>, RunnerError> {
    let numbered: Vec<u16> = ports
        .iter()
        .filter_map(|p| match p {
            PortSpec::Number(n) => Some(*n),
            PortSpec::Wildcard => None,
        })
        .collect();

    if numbered.is_empty() {
        return Ok(Vec::new());
    }

    let port_list = numbered.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");

    let output = Command::new("nmap")
        .args(["-n", "-Pn", "-p", &port_list, "-oX", "-", target_ip])
        .output()
        .map_err(RunnerError::Io)?;

    if !output.status.success() {
        return Err(RunnerError::Io(std::io::Error::other(format!(
            "nmap exited with {} scanning {target_ip}",
            output.status
        ))));
    }

    let xml = String::from_utf8_lossy(&output.stdout);
    let run: NmapRun = quick_xml::de::from_str(&xml).map_err(|e| {
        RunnerError::Io(std::io::Error::other(format!("failed to parse nmap XML output: {e}")))
    })?;

    if run.hosts.is_empty() {
        return Err(RunnerError::Io(std::io::Error::other(format!(
            "nmap reported no hosts scanning {target_ip}"
        ))));
    }

    let mut scanned: Vec<(u16, String)> = Vec::new();
    for host in run.hosts {
        if let Some(ports) = host.ports {
            for port in ports.port {
                scanned.push((port.portid, port.state.state));
            }
        }
    }

    let mut results = Vec::with_capacity(numbered.len());
    for port in numbered {
        let state = scanned
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, s)| s.clone());
        let success = !matches!(state.as_deref(), Some("filtered"));
        results.push((
            PortSpec::Number(port),
            PortResult {
                success,
                nmap_state: state,
                error: None,
            },
        ));
    }

    Ok(results)
}
