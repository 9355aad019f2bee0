//! Volume maintenance and snapshots.
//!
//! The single-step operations require an idle guest and fail otherwise. The
//! composite ones ([`VirtGuest::snapshot`], [`VirtGuest::commit`],
//! [`VirtGuest::restore`]) bring the guest into a suitable state first and
//! back afterwards.

use std::sync::Arc;

use guestvisor_shared::{GuestvisorError, GuestvisorResult, ResultExt};

use super::VirtGuest;
use crate::bot::Snapshot;
use crate::context::CallContext;
use crate::models::{Status, Volume};

const STOPPED_OR_PAUSED: &[Status] = &[Status::Stopped, Status::Paused];
const STOPPED: &[Status] = &[Status::Stopped];

enum VolumeOp<'a> {
    Check,
    Repair,
    CreateSnapshot,
    CommitSnapshot(&'a str),
    CommitSnapshotByDay(u32),
    RestoreSnapshot(&'a str),
}

impl VolumeOp<'_> {
    fn name(&self) -> &'static str {
        match self {
            VolumeOp::Check => "check volume",
            VolumeOp::Repair => "repair volume",
            VolumeOp::CreateSnapshot => "create snapshot",
            VolumeOp::CommitSnapshot(_) => "commit snapshot",
            VolumeOp::CommitSnapshotByDay(_) => "commit snapshot by day",
            VolumeOp::RestoreSnapshot(_) => "restore snapshot",
        }
    }

    fn allowed(&self) -> &'static [Status] {
        match self {
            VolumeOp::Check | VolumeOp::CreateSnapshot => STOPPED_OR_PAUSED,
            _ => STOPPED,
        }
    }
}

impl VirtGuest {
    async fn volume_op(&self, vol_id: &str, op: VolumeOp<'_>) -> GuestvisorResult<()> {
        let name = op.name();
        self.require_status(op.allowed(), name)?;
        let vol = self.find_vol(vol_id)?;

        let (session, bot) = self.locked_bot().await?;
        let result = match op {
            VolumeOp::Check => bot.check_volume(&vol).await,
            VolumeOp::Repair => bot.repair_volume(&vol).await,
            VolumeOp::CreateSnapshot => bot.create_snapshot(&vol).await,
            VolumeOp::CommitSnapshot(snap_id) => bot.commit_snapshot(&vol, snap_id).await,
            VolumeOp::CommitSnapshotByDay(day) => bot.commit_snapshot_by_day(&vol, day).await,
            VolumeOp::RestoreSnapshot(snap_id) => bot.restore_snapshot(&vol, snap_id).await,
        }
        .with_context(|| format!("{} {}", name, vol.id));
        session.finish().await;

        if result.is_ok() {
            tracing::info!(guest_id = %self.meta.id, volume_id = %vol.id, op = name, "Volume operation done");
        }
        result
    }

    pub async fn check_volume(&self, vol_id: &str) -> GuestvisorResult<()> {
        self.volume_op(vol_id, VolumeOp::Check).await
    }

    pub async fn repair_volume(&self, vol_id: &str) -> GuestvisorResult<()> {
        self.volume_op(vol_id, VolumeOp::Repair).await
    }

    pub async fn create_snapshot(&self, vol_id: &str) -> GuestvisorResult<()> {
        self.volume_op(vol_id, VolumeOp::CreateSnapshot).await
    }

    pub async fn commit_snapshot(&self, vol_id: &str, snap_id: &str) -> GuestvisorResult<()> {
        self.volume_op(vol_id, VolumeOp::CommitSnapshot(snap_id)).await
    }

    /// Merge every snapshot older than `day` days into the base image.
    pub async fn commit_snapshot_by_day(&self, vol_id: &str, day: u32) -> GuestvisorResult<()> {
        self.volume_op(vol_id, VolumeOp::CommitSnapshotByDay(day)).await
    }

    pub async fn restore_snapshot(&self, vol_id: &str, snap_id: &str) -> GuestvisorResult<()> {
        self.volume_op(vol_id, VolumeOp::RestoreSnapshot(snap_id)).await
    }

    /// Snapshots of one volume, or of every volume when `vol_id` is `None`.
    pub async fn list_snapshots(
        &self,
        vol_id: Option<&str>,
    ) -> GuestvisorResult<Vec<(Volume, Vec<Snapshot>)>> {
        let vols: Vec<Volume> = self
            .meta
            .vols
            .iter()
            .filter(|v| vol_id.is_none_or(|id| v.id == id))
            .cloned()
            .collect();
        if vols.is_empty() {
            return Err(GuestvisorError::NotFound(format!(
                "volume {} of guest {}",
                vol_id.unwrap_or("*"),
                self.meta.id
            )));
        }

        let session = self.open_bot(true).await?;
        let bot = Arc::clone(session.bot());
        let result = async {
            let mut listed = Vec::with_capacity(vols.len());
            for vol in vols {
                let snaps = bot
                    .list_snapshots(&vol)
                    .await
                    .with_context(|| format!("list snapshots of {}", vol.id))?;
                listed.push((vol, snaps));
            }
            Ok(listed)
        }
        .await;
        session.finish().await;
        result
    }

    /// Snapshot a volume without losing the guest's running state. A running
    /// guest is paused around the snapshot. When the fresh snapshot fails its
    /// check, the guest is stopped, the volume repaired, and the guest booted
    /// again.
    pub async fn snapshot(&mut self, vol_id: &str, ctx: &CallContext) -> GuestvisorResult<()> {
        let mut suspended = false;
        let mut stopped = false;
        if self.meta.status == Some(Status::Running) {
            self.suspend().await?;
            suspended = true;
        }

        self.create_snapshot(vol_id).await?;

        if let Err(e) = self.check_volume(vol_id).await {
            tracing::warn!(guest_id = %self.meta.id, volume_id = vol_id, error = %e, "Snapshot check failed, repairing");
            if suspended {
                self.stop(true).await?;
                suspended = false;
                stopped = true;
            }
            self.repair_volume(vol_id).await?;
        }

        if suspended {
            self.resume().await
        } else if stopped {
            self.start(ctx).await
        } else {
            Ok(())
        }
    }

    pub async fn commit(&mut self, vol_id: &str, snap_id: &str, ctx: &CallContext) -> GuestvisorResult<()> {
        self.while_stopped(vol_id, VolumeOp::CommitSnapshot(snap_id), ctx).await
    }

    pub async fn commit_by_day(&mut self, vol_id: &str, day: u32, ctx: &CallContext) -> GuestvisorResult<()> {
        self.while_stopped(vol_id, VolumeOp::CommitSnapshotByDay(day), ctx).await
    }

    pub async fn restore(&mut self, vol_id: &str, snap_id: &str, ctx: &CallContext) -> GuestvisorResult<()> {
        self.while_stopped(vol_id, VolumeOp::RestoreSnapshot(snap_id), ctx).await
    }

    /// Hard-stop a running guest, run `op`, and boot it again.
    async fn while_stopped(
        &mut self,
        vol_id: &str,
        op: VolumeOp<'_>,
        ctx: &CallContext,
    ) -> GuestvisorResult<()> {
        let was_running = self.meta.status == Some(Status::Running);
        if was_running {
            self.stop(true).await?;
        }
        self.volume_op(vol_id, op).await?;
        if was_running {
            self.start(ctx).await?;
        }
        Ok(())
    }
}
