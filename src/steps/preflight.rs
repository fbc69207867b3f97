//! Step 0: the connectivity probe is installed, rolled out and healthy.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{Step, StepContext};
use crate::phase::MigrationPhase;

pub struct Preflight {
    ctx: Arc<StepContext>,
}

impl Preflight {
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for Preflight {
    fn phase(&self) -> MigrationPhase {
        MigrationPhase::Preflight
    }

    async fn ready(&self) -> Result<bool> {
        let ctx = &self.ctx;
        if !ctx.inventory.has_all(&ctx.config.preflight_resources).await? {
            return Ok(false);
        }
        ctx.probe.is_healthy().await
    }

    async fn run(&self, dry_run: bool) -> Result<()> {
        let ctx = &self.ctx;
        let probe_manifest = &ctx.config.paths.probe;

        if !ctx.inventory.has_all(&ctx.config.preflight_resources).await? {
            if dry_run {
                info!("Would apply {}", probe_manifest.display());
            } else {
                info!("Applying {}", probe_manifest.display());
                ctx.ops.apply_manifest(probe_manifest).await?;
            }
        }

        if dry_run {
            info!("Would wait for preflight resources and check connectivity");
            return Ok(());
        }

        ctx.waiter.wait_all(&ctx.config.preflight_resources).await?;
        ctx.probe.check().await
    }
}
