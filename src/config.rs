//! CLI arguments and the migration configuration file.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::error::MigrationError;
use crate::k8s::workload::WorkloadRef;
use crate::labels::Labels;
use crate::phase::MigrationPhase;
use crate::resources::ResourceSet;
use crate::sequencer::StepSelection;
use crate::steps::NodeTarget;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Live node-by-node CNI migration CLI tool.
///
/// Moves a running cluster from one network plugin to another through
/// ordered, idempotent, resumable steps. Dry-run unless --no-dry-run is given.
#[derive(Parser, Debug, Clone)]
#[command(name = "cni-migration")]
#[command(about = "Live node-by-node CNI migration CLI tool for Kubernetes clusters")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Path to the migration configuration file
    #[arg(short, long, default_value = "config.yaml", env = "CNI_MIGRATION_CONFIG")]
    pub config: PathBuf,

    /// Kubernetes context to use
    #[arg(long, env = "KUBECONFIG_CONTEXT")]
    pub context: Option<String>,

    /// Path to a kubeconfig file
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Apply changes. Without this flag every step only logs what it would do
    #[arg(long, default_value = "false")]
    pub no_dry_run: bool,

    /// Skip the confirmation prompt before a live run
    #[arg(short, long, default_value = "false")]
    pub yes: bool,

    /// Print per-node migration state and exit
    #[arg(long, default_value = "false")]
    pub status: bool,

    /// Run every step in order
    #[arg(
        long,
        conflicts_with_all = [
            "step_preflight",
            "step_prepare",
            "step_roll_nodes",
            "step_change_cni_priority",
            "step_migrate_all_nodes",
            "step_migrate_node",
            "step_clean_up",
        ]
    )]
    pub step_all: bool,

    /// [0] Check the connectivity probe is installed and healthy
    #[arg(short = '0', long)]
    pub step_preflight: bool,

    /// [1] Label nodes and install the new plugin alongside the old one
    #[arg(short = '1', long)]
    pub step_prepare: bool,

    /// [2] Drain and roll every node onto the dual-plugin setup
    #[arg(short = '2', long)]
    pub step_roll_nodes: bool,

    /// [3] Give the new plugin CNI priority on every node
    #[arg(short = '3', long)]
    pub step_change_cni_priority: bool,

    /// [4] Migrate every node to the new plugin
    #[arg(short = '4', long, conflicts_with = "step_migrate_node")]
    pub step_migrate_all_nodes: bool,

    /// [4] Migrate a single node to the new plugin (repeatable)
    #[arg(long, value_name = "NODE", conflicts_with = "step_clean_up")]
    pub step_migrate_node: Vec<String>,

    /// [5] Remove the old plugin and overlay resources
    #[arg(short = '5', long)]
    pub step_clean_up: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info", env = "CNI_MIGRATION_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Application configuration derived from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: PathBuf,
    pub context: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub dry_run: bool,
    pub yes: bool,
    pub status: bool,
    pub selection: StepSelection,
    pub node_target: NodeTarget,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Create config from CLI arguments.
    pub fn from_args(args: Args) -> Self {
        let selection = if args.step_all {
            StepSelection::All
        } else {
            let flags = [
                args.step_preflight,
                args.step_prepare,
                args.step_roll_nodes,
                args.step_change_cni_priority,
                args.step_migrate_all_nodes || !args.step_migrate_node.is_empty(),
                args.step_clean_up,
            ];
            StepSelection::Only(
                MigrationPhase::ALL
                    .into_iter()
                    .zip(flags)
                    .filter_map(|(phase, set)| set.then_some(phase))
                    .collect::<BTreeSet<_>>(),
            )
        };

        let node_target = if args.step_migrate_node.is_empty() {
            NodeTarget::All
        } else {
            NodeTarget::Named(args.step_migrate_node)
        };

        Self {
            config_path: args.config,
            context: args.context,
            kubeconfig: args.kubeconfig,
            dry_run: !args.no_dry_run,
            yes: args.yes,
            status: args.status,
            selection,
            node_target,
            log_level: args.log_level,
            log_format: args.log_format,
        }
    }
}

/// Manifest files applied verbatim with kubectl.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Paths {
    /// Connectivity probe agent.
    pub probe: PathBuf,
    pub new_plugin: PathBuf,
    /// Overlay network (multiplexing) plugin.
    pub overlay: PathBuf,
    /// NetworkAttachmentDefinition applied to every namespace before
    /// workloads are annotated.
    #[serde(default)]
    pub network_attachment: Option<PathBuf>,
}

/// DaemonSets the steps act on directly.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Workloads {
    pub old_plugin: WorkloadRef,
    pub new_plugin: WorkloadRef,
    pub probe: WorkloadRef,
}

/// How probe agent pods are found and asked for their status.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProbeSettings {
    #[serde(default = "default_probe_selector")]
    pub selector: String,
    #[serde(default = "default_probe_command")]
    pub command: Vec<String>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            selector: default_probe_selector(),
            command: default_probe_command(),
        }
    }
}

fn default_probe_selector() -> String {
    "app=knet-stress".to_string()
}

fn default_probe_command() -> Vec<String> {
    vec!["/knet-stress".to_string(), "-status".to_string()]
}

/// Pod-template annotation attaching workloads to the secondary network.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetworkAttachment {
    pub key: String,
    pub value: String,
}

/// Fixed-interval polling with an overall deadline.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PollSettings {
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Timeouts {
    #[serde(default = "default_readiness")]
    pub readiness: PollSettings,
    #[serde(default = "default_connectivity")]
    pub connectivity: PollSettings,
    #[serde(default = "default_pod_deletion")]
    pub pod_deletion: PollSettings,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            readiness: default_readiness(),
            connectivity: default_connectivity(),
            pod_deletion: default_pod_deletion(),
        }
    }
}

fn default_readiness() -> PollSettings {
    PollSettings {
        interval_seconds: 2,
        timeout_seconds: 600,
    }
}

fn default_connectivity() -> PollSettings {
    PollSettings {
        interval_seconds: 5,
        timeout_seconds: 1000,
    }
}

fn default_pod_deletion() -> PollSettings {
    PollSettings {
        interval_seconds: 1,
        timeout_seconds: 300,
    }
}

/// Contents of the migration configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MigrationConfig {
    pub labels: Labels,
    pub paths: Paths,
    pub workloads: Workloads,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub network_attachment: Option<NetworkAttachment>,
    #[serde(default)]
    pub preflight_resources: ResourceSet,
    #[serde(default)]
    pub prepare_resources: ResourceSet,
    #[serde(default)]
    pub watched_resources: ResourceSet,
    #[serde(default)]
    pub clean_up_resources: ResourceSet,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl MigrationConfig {
    /// Load and validate the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let keys = self.labels.keys();
        if keys.iter().any(|k| k.trim().is_empty()) || self.labels.value.is_empty() {
            return Err(MigrationError::Config("label keys and value must not be empty".into()).into());
        }

        let mut seen = HashSet::new();
        if let Some(dup) = keys.iter().find(|k| !seen.insert(**k)) {
            return Err(MigrationError::Config(format!("duplicate label key: {}", dup)).into());
        }

        let polls = [
            ("readiness", self.timeouts.readiness),
            ("connectivity", self.timeouts.connectivity),
            ("podDeletion", self.timeouts.pod_deletion),
        ];
        for (name, poll) in polls {
            if poll.interval_seconds == 0 || poll.timeout_seconds == 0 {
                return Err(MigrationError::Config(format!(
                    "timeouts.{}: interval and timeout must be positive",
                    name
                ))
                .into());
            }
        }

        if self.probe.command.is_empty() {
            return Err(MigrationError::Config("probe.command must not be empty".into()).into());
        }

        if let Some(na) = &self.network_attachment {
            if na.key.is_empty() || na.value.is_empty() {
                return Err(MigrationError::Config(
                    "networkAttachment key and value must not be empty".into(),
                )
                .into());
            }
            if self.paths.network_attachment.is_none() {
                return Err(MigrationError::Config(
                    "networkAttachment requires paths.networkAttachment".into(),
                )
                .into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> MigrationConfig {
    serde_yaml::from_str(SAMPLE).unwrap()
}

#[cfg(test)]
const SAMPLE: &str = r#"
labels:
  dual: node-role.kubernetes.io/canal-cilium
  newPlugin: node-role.kubernetes.io/cilium
  rolled: node-role.kubernetes.io/rolled
  priorityOld: node-role.kubernetes.io/cni-priority-canal
  priorityNew: node-role.kubernetes.io/cni-priority-cilium
  migrated: node-role.kubernetes.io/migrated
paths:
  probe: ./resources/knet-stress.yaml
  newPlugin: ./resources/cilium.yaml
  overlay: ./resources/multus.yaml
workloads:
  oldPlugin: {namespace: kube-system, name: canal}
  newPlugin: {namespace: kube-system, name: cilium-migrated}
  probe: {namespace: knet-stress, name: knet-stress}
preflightResources:
  daemonsets:
    knet-stress: [knet-stress]
prepareResources:
  daemonsets:
    kube-system: [cilium, cilium-migrated, multus]
watchedResources:
  deployments:
    kube-system: [coredns]
  daemonsets:
    kube-system: [canal, cilium, cilium-migrated, multus]
cleanUpResources:
  daemonsets:
    kube-system: [canal, cilium, multus]
timeouts:
  readiness: {intervalSeconds: 1, timeoutSeconds: 5}
  connectivity: {intervalSeconds: 1, timeoutSeconds: 5}
  podDeletion: {intervalSeconds: 1, timeoutSeconds: 5}
"#;
