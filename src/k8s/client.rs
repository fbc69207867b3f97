//! Kubernetes client builder with kubeconfig context support.

use std::path::Path;

use anyhow::Result;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::debug;

use crate::error::MigrationError;

/// Build a Kubernetes client.
///
/// An explicit kubeconfig path or context takes precedence; otherwise the
/// default inference (KUBECONFIG, ~/.kube/config, in-cluster) is used.
pub async fn build_client(context: Option<&str>, kubeconfig: Option<&Path>) -> Result<kube::Client> {
    if context.is_none() && kubeconfig.is_none() {
        debug!("Using default kubeconfig context");
        let client = kube::Client::try_default()
            .await
            .map_err(|e| MigrationError::KubernetesApi(format!("kubeconfig: {}", e)))?;
        return Ok(client);
    }

    let kc = read_kubeconfig(kubeconfig)?;
    if let Some(ctx) = context {
        debug!("Using kubeconfig context: {}", ctx);
    }

    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let config = kube::Config::from_custom_kubeconfig(kc, &options)
        .await
        .map_err(|e| MigrationError::KubernetesApi(format!("kubeconfig: {}", e)))?;

    let client = kube::Client::try_from(config)
        .map_err(|e| MigrationError::KubernetesApi(format!("kubeconfig: {}", e)))?;
    Ok(client)
}

fn read_kubeconfig(path: Option<&Path>) -> Result<Kubeconfig> {
    let kc = match path {
        Some(p) => {
            debug!("Reading kubeconfig from {}", p.display());
            Kubeconfig::read_from(p)
        }
        None => Kubeconfig::read(),
    };
    kc.map_err(|e| MigrationError::KubernetesApi(format!("kubeconfig: {}", e)).into())
}

/// Context name shown in banners.
pub fn current_context(context: Option<&str>, kubeconfig: Option<&Path>) -> String {
    if let Some(ctx) = context {
        return ctx.to_string();
    }

    let kc = match kubeconfig {
        Some(p) => Kubeconfig::read_from(p).ok(),
        None => Kubeconfig::read().ok(),
    };
    kc.and_then(|kc| kc.current_context)
        .unwrap_or_else(|| "unknown".to_string())
}
