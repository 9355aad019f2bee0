//! Domain boot.
//!
//! ```text
//! Stage 1 (abort on failure):
//!   domain_boot     start the domain
//!   agent_wait      poll the guest agent with linear backoff
//! Stage 2 (best effort):
//!   nic_setup       configure addresses inside the guest
//!   volume_mount    mount data volumes
//!   batch_exec      run the configured command batches
//!   extra_network   bind extra networks
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use guestvisor_shared::{GuestvisorError, GuestvisorResult, ResultExt};

use super::VirtGuest;
use crate::bot::Bot;
use crate::config::VirtConfig;
use crate::context::CallContext;
use crate::models::Guest;
use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineExecutor, PipelineMetrics, PipelineTask, Stage};

struct BootContext {
    bot: Arc<dyn Bot>,
    guest: Guest,
    config: Arc<VirtConfig>,
    agent_deadline: Instant,
}

type BootCtx = Arc<BootContext>;

fn boot_plan() -> ExecutionPlan<BootCtx> {
    let stages: Vec<Stage<BoxedTask<BootCtx>>> = vec![
        Stage::sequential(vec![Box::new(DomainBootTask), Box::new(AgentWaitTask)]),
        Stage::best_effort(vec![
            Box::new(NicSetupTask),
            Box::new(VolumeMountTask),
            Box::new(BatchExecTask),
            Box::new(ExtraNetworkTask),
        ]),
    ];
    ExecutionPlan::new(stages)
}

/// When to give up on the agent: the boot timeout, cut short by the
/// caller's deadline less the safety margin.
fn agent_deadline(config: &VirtConfig, ctx: &CallContext) -> Instant {
    let by_config = Instant::now() + config.ga_boot_timeout;
    match ctx.deadline() {
        Some(deadline) => by_config.min(
            deadline
                .checked_sub(config.ga_deadline_margin)
                .unwrap_or_else(Instant::now),
        ),
        None => by_config,
    }
}

impl VirtGuest {
    /// Run the boot plan against an already locked bot.
    pub(super) async fn boot_with(&self, bot: &Arc<dyn Bot>, ctx: &CallContext) -> GuestvisorResult<PipelineMetrics> {
        let boot_ctx = Arc::new(BootContext {
            bot: Arc::clone(bot),
            guest: self.meta.clone(),
            config: Arc::clone(&self.rt.config),
            agent_deadline: agent_deadline(&self.rt.config, ctx),
        });

        let metrics = PipelineExecutor::execute(boot_plan(), boot_ctx).await?;
        tracing::info!(
            guest_id = %self.meta.id,
            elapsed = ?metrics.elapsed,
            domain_boot = ?metrics.task_elapsed("domain_boot"),
            agent_wait = ?metrics.task_elapsed("agent_wait"),
            failed = ?metrics.failed_tasks(),
            "Guest booted"
        );
        Ok(metrics)
    }
}

fn task_start(ctx: &BootCtx, task_name: &str) -> String {
    tracing::debug!(guest_id = %ctx.guest.id, task = task_name, "Boot task started");
    ctx.guest.id.clone()
}

fn log_task_error(guest_id: &str, task_name: &str, err: &GuestvisorError) {
    tracing::warn!(guest_id = %guest_id, task = task_name, error = %err, "Boot task failed");
}

struct DomainBootTask;

#[async_trait]
impl PipelineTask<BootCtx> for DomainBootTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> GuestvisorResult<()> {
        let task_name = self.name();
        let guest_id = task_start(&ctx, task_name);
        ctx.bot
            .boot()
            .await
            .context("boot domain")
            .inspect_err(|e| log_task_error(&guest_id, task_name, e))
    }

    fn name(&self) -> &str {
        "domain_boot"
    }
}

struct AgentWaitTask;

#[async_trait]
impl PipelineTask<BootCtx> for AgentWaitTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> GuestvisorResult<()> {
        let task_name = self.name();
        let guest_id = task_start(&ctx, task_name);
        wait_agent(&ctx)
            .await
            .inspect_err(|e| log_task_error(&guest_id, task_name, e))
    }

    fn name(&self) -> &str {
        "agent_wait"
    }
}

/// Backoff before the `attempt`-th retry: `unit * min(attempt, cap)`.
fn backoff(config: &VirtConfig, attempt: u32) -> Duration {
    config.ga_backoff_unit * attempt.min(config.ga_backoff_cap.max(1))
}

async fn wait_agent(ctx: &BootContext) -> GuestvisorResult<()> {
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        let err = match ctx.bot.ping_agent().await {
            Ok(()) => {
                tracing::debug!(
                    guest_id = %ctx.guest.id,
                    attempts = attempt + 1,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Guest agent reachable"
                );
                return Ok(());
            }
            Err(e) => e,
        };

        attempt += 1;
        let pause = backoff(&ctx.config, attempt);
        if Instant::now() + pause >= ctx.agent_deadline {
            return Err(GuestvisorError::Timeout(started.elapsed()).context(format!(
                "guest agent unreachable after {} attempts: {}",
                attempt, err
            )));
        }
        tracing::debug!(guest_id = %ctx.guest.id, attempt, error = %err, "Guest agent not ready");
        tokio::time::sleep(pause).await;

        if let Err(e) = ctx.bot.reload_agent().await {
            tracing::debug!(guest_id = %ctx.guest.id, error = %e, "Failed to reload guest agent");
        }
    }
}

struct NicSetupTask;

#[async_trait]
impl PipelineTask<BootCtx> for NicSetupTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> GuestvisorResult<()> {
        let task_name = self.name();
        let guest_id = task_start(&ctx, task_name);
        ctx.bot
            .setup_nics(&ctx.guest)
            .await
            .inspect_err(|e| log_task_error(&guest_id, task_name, e))
    }

    fn name(&self) -> &str {
        "nic_setup"
    }
}

struct VolumeMountTask;

#[async_trait]
impl PipelineTask<BootCtx> for VolumeMountTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> GuestvisorResult<()> {
        let task_name = self.name();
        let guest_id = task_start(&ctx, task_name);

        let mut failed = Vec::new();
        for vol in ctx.guest.vols.iter().filter(|v| !v.sys) {
            if let Err(e) = ctx.bot.mount_volume(vol).await {
                tracing::warn!(guest_id = %guest_id, mount_dir = %vol.mount_dir, error = %e, "Failed to mount volume");
                failed.push(vol.mount_dir.clone());
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        Err(GuestvisorError::Hypervisor(format!("failed to mount {}", failed.join(", "))))
    }

    fn name(&self) -> &str {
        "volume_mount"
    }
}

struct BatchExecTask;

#[async_trait]
impl PipelineTask<BootCtx> for BatchExecTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> GuestvisorResult<()> {
        let task_name = self.name();
        let guest_id = task_start(&ctx, task_name);

        for (index, batch) in ctx.config.batches.iter().enumerate() {
            match ctx.bot.exec_batch(batch).await {
                Ok(()) => {}
                Err(e) if batch.force_ok => {
                    tracing::warn!(guest_id = %guest_id, batch = index, error = %e, "Required batch failed, skipping the rest");
                    break;
                }
                Err(e) => {
                    tracing::warn!(guest_id = %guest_id, batch = index, error = %e, "Batch failed");
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "batch_exec"
    }
}

struct ExtraNetworkTask;

#[async_trait]
impl PipelineTask<BootCtx> for ExtraNetworkTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> GuestvisorResult<()> {
        let task_name = self.name();
        let guest_id = task_start(&ctx, task_name);

        let mut last_err = None;
        for network in &ctx.guest.extra_networks {
            if let Err(e) = ctx.bot.bind_extra_network(network).await {
                tracing::warn!(guest_id = %guest_id, network = %network.name, error = %e, "Failed to bind extra network");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "extra_network"
    }
}
