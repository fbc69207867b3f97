//! Node operations delegated to an external `kubectl`.
//!
//! Informational output is discarded; stderr is captured and surfaced in
//! the error when the command exits non-zero.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::MigrationError;

/// Narrow capability for operations the API client does not cover.
#[async_trait]
pub trait NodeOps: Send + Sync {
    /// Cordon and evict, leaving daemon-managed pods in place.
    async fn drain(&self, node: &str, delete_local_data: bool) -> Result<()>;

    async fn uncordon(&self, node: &str) -> Result<()>;

    async fn apply_manifest(&self, path: &Path) -> Result<()>;

    /// Apply a namespace-less manifest into `namespace`.
    async fn apply_manifest_in(&self, path: &Path, namespace: &str) -> Result<()>;

    /// Delete every object in a manifest, ignoring ones already gone.
    async fn delete_manifest(&self, path: &Path) -> Result<()>;

    /// Run a command inside a pod. Non-zero exit is an error.
    async fn exec(&self, namespace: &str, pod: &str, command: &[String]) -> Result<()>;
}

/// `NodeOps` backed by the `kubectl` binary on PATH.
pub struct Kubectl {
    global_args: Vec<String>,
    cancel: CancellationToken,
}

impl Kubectl {
    pub fn new(
        context: Option<&str>,
        kubeconfig: Option<&Path>,
        cancel: CancellationToken,
    ) -> Self {
        let mut global_args = Vec::new();
        if let Some(path) = kubeconfig {
            global_args.push(format!("--kubeconfig={}", path.display()));
        }
        if let Some(ctx) = context {
            global_args.push(format!("--context={}", ctx));
        }
        Self {
            global_args,
            cancel,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        let rendered = format!("kubectl {}", args.join(" "));
        debug!("Running: {}", rendered);

        let mut command = Command::new("kubectl");
        command.args(&self.global_args).args(&args);
        self.spawn_and_wait(&mut command, rendered).await
    }

    async fn spawn_and_wait(&self, command: &mut Command, rendered: String) -> Result<()> {
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute `{}`. Is kubectl installed?", rendered))?;

        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(MigrationError::Cancelled.into()),
            output = child.wait_with_output() => output
                .with_context(|| format!("Failed to wait for `{}`", rendered))?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(MigrationError::Command {
                command: rendered,
                stderr,
            }
            .into());
        }

        Ok(())
    }
}

fn drain_args(node: &str, delete_local_data: bool) -> Vec<String> {
    let mut args = vec![
        "drain".to_string(),
        node.to_string(),
        "--ignore-daemonsets".to_string(),
    ];
    if delete_local_data {
        args.push("--delete-emptydir-data".to_string());
    }
    args
}

fn manifest_args(verb: &str, path: &Path) -> Vec<String> {
    let mut args = vec![verb.to_string(), "-f".to_string(), path.display().to_string()];
    if verb == "delete" {
        args.push("--ignore-not-found".to_string());
    }
    args
}

fn exec_args(namespace: &str, pod: &str, command: &[String]) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        pod.to_string(),
        "--".to_string(),
    ];
    args.extend(command.iter().cloned());
    args
}

#[async_trait]
impl NodeOps for Kubectl {
    async fn drain(&self, node: &str, delete_local_data: bool) -> Result<()> {
        self.run(drain_args(node, delete_local_data)).await
    }

    async fn uncordon(&self, node: &str) -> Result<()> {
        self.run(vec!["uncordon".to_string(), node.to_string()]).await
    }

    async fn apply_manifest(&self, path: &Path) -> Result<()> {
        self.run(manifest_args("apply", path)).await
    }

    async fn apply_manifest_in(&self, path: &Path, namespace: &str) -> Result<()> {
        let mut args = manifest_args("apply", path);
        args.extend(["-n".to_string(), namespace.to_string()]);
        self.run(args).await
    }

    async fn delete_manifest(&self, path: &Path) -> Result<()> {
        self.run(manifest_args("delete", path)).await
    }

    async fn exec(&self, namespace: &str, pod: &str, command: &[String]) -> Result<()> {
        self.run(exec_args(namespace, pod, command)).await
    }
}
