//! Synthesizes and runs NetworkPolicy connectivity probes against a
//! live cluster: translates declared policies into a minimal set of
//! positive/negative reachability cases, materializes the cluster
//! resources to run them, and reconciles the observed results.

pub mod case;
pub mod config;
pub mod error;
pub mod generator;
pub mod host;
pub mod k8s;
pub mod labels;
pub mod orchestrator;
pub mod rule;
pub mod runner;
