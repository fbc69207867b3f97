//! Kubernetes access: client construction, cluster state and node operations.

pub mod client;
pub mod cluster;
#[cfg(test)]
pub mod fake;
pub mod node_ops;
pub mod workload;
