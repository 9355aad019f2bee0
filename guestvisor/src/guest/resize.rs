//! Hot and cold resize of CPU, memory, data volumes and GPUs.
//!
//! The requested volume map is the complete desired set of data volumes,
//! keyed by mount dir. Compared against what the guest has:
//!
//! | request                 | existing volume | action         |
//! |-------------------------|-----------------|----------------|
//! | absent                  | yes             | detach         |
//! | size 0                  | yes             | detach         |
//! | size > existing         | yes             | amplify        |
//! | size <= existing        | yes             | nothing        |
//! | size > 0                | no              | attach new     |
//!
//! Volumes never shrink.

use std::collections::BTreeMap;

use guestvisor_shared::{GuestvisorError, GuestvisorResult, ResultExt};

use super::VirtGuest;
use crate::models::{GpuParams, Lifecycle, Status, Volume, parse_mount_size};

/// Desired shape of a guest after a resize.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResizeRequest {
    /// Zero keeps the current CPU count.
    pub cpu: u32,
    /// Bytes; zero keeps the current memory.
    pub memory: u64,
    /// Mount dir to size in bytes. `None` leaves volumes untouched.
    pub volumes: Option<BTreeMap<String, u64>>,
    /// Product to card count. `None` leaves GPUs untouched.
    pub gpu: Option<GpuParams>,
}

impl ResizeRequest {
    /// Add a `<mount_dir>=<size>` volume entry.
    pub fn with_volume(mut self, spec: &str) -> GuestvisorResult<Self> {
        let (mount, size) = parse_mount_size(spec)?;
        self.volumes.get_or_insert_with(BTreeMap::new).insert(mount, size);
        Ok(self)
    }
}

/// Cards in `a` beyond what `b` has, per product.
fn gpu_diff(a: &GpuParams, b: &GpuParams) -> GpuParams {
    a.iter()
        .filter_map(|(product, &count)| {
            let have = b.get(product).copied().unwrap_or(0);
            (count > have).then(|| (product.clone(), count - have))
        })
        .collect()
}

impl VirtGuest {
    /// Apply `req`. Only a stopped or running guest may be resized.
    pub async fn resize(&mut self, req: &ResizeRequest) -> GuestvisorResult<()> {
        if !self.meta.check_forward_status(Status::Resizing) {
            return Err(GuestvisorError::ForwardStatus {
                from: self.meta.status.map(|s| s.to_string()).unwrap_or_default(),
                to: Status::Resizing.to_string(),
            }
            .context("only stopped or running guest can be resized"));
        }

        if let Some(volumes) = &req.volumes {
            self.resize_volumes(volumes).await?;
        }
        if let Some(gpu) = &req.gpu {
            self.resize_gpu(gpu).await?;
        }

        let cpu = if req.cpu == 0 { self.meta.cpu } else { req.cpu };
        let memory = if req.memory == 0 { self.meta.memory } else { req.memory };
        if cpu == self.meta.cpu && memory == self.meta.memory {
            return Ok(());
        }
        self.resize_spec(cpu, memory).await
    }

    async fn resize_volumes(&mut self, requested: &BTreeMap<String, u64>) -> GuestvisorResult<()> {
        let existing: Vec<Volume> = self.meta.vols.iter().filter(|v| !v.sys).cloned().collect();

        for vol in existing.iter().filter(|v| !requested.contains_key(&v.mount_dir)) {
            self.detach_vol(vol).await?;
        }

        for (mount_dir, &size) in requested {
            match existing.iter().find(|v| &v.mount_dir == mount_dir) {
                Some(vol) if size > 0 => self.amplify_vol(vol, size).await?,
                Some(vol) => self.detach_vol(vol).await?,
                None if size == 0 => {}
                None => self.attach_vol(mount_dir, size).await?,
            }
        }
        Ok(())
    }

    async fn amplify_vol(&mut self, vol: &Volume, size: u64) -> GuestvisorResult<()> {
        if size <= vol.size {
            if size < vol.size {
                tracing::warn!(
                    guest_id = %self.meta.id,
                    mount_dir = %vol.mount_dir,
                    current = vol.size,
                    requested = size,
                    "Volumes cannot shrink, ignoring"
                );
            }
            return Ok(());
        }

        let delta = size - vol.size;
        let (session, bot) = self.locked_bot().await?;
        let result = bot
            .amplify_volume(vol, delta)
            .await
            .with_context(|| format!("amplify volume {}", vol.mount_dir));
        session.finish().await;
        result?;

        if let Some(stored) = self.meta.vol_by_id_mut(&vol.id) {
            stored.size = size;
        }
        tracing::info!(guest_id = %self.meta.id, mount_dir = %vol.mount_dir, size, "Amplified volume");
        self.save_all()
    }

    async fn attach_vol(&mut self, mount_dir: &str, size: u64) -> GuestvisorResult<()> {
        let mut vol = Volume::new_data(mount_dir, size)?;
        if let Some(status) = self.meta.status {
            vol.set_status(status, true)?;
        }
        let vol_id = vol.id.clone();
        self.meta
            .append_vols(vec![vol], self.rt.config.max_volumes_count)?;
        let Some(vol) = self.meta.vol_by_id(&vol_id).cloned() else {
            return Err(GuestvisorError::Internal(format!("volume {} vanished", vol_id)));
        };

        let (session, bot) = match self.locked_bot().await {
            Ok(opened) => opened,
            Err(e) => {
                self.meta.remove_vol(&vol_id);
                return Err(e);
            }
        };
        let attached = bot.attach_volume(&vol).await;
        session.finish().await;

        let rollback = match attached {
            Ok(rollback) => rollback,
            Err(e) => {
                self.meta.remove_vol(&vol_id);
                return Err(e.context(format!("attach volume {}", mount_dir)));
            }
        };

        if let Err(e) = self.meta.save_with_new_vol(self.rt.store.as_ref(), &vol_id) {
            if let Some(rollback) = rollback {
                rollback.await;
            }
            self.meta.remove_vol(&vol_id);
            return Err(e);
        }
        tracing::info!(guest_id = %self.meta.id, mount_dir, device = %vol.device, "Attached volume");
        Ok(())
    }

    async fn detach_vol(&mut self, vol: &Volume) -> GuestvisorResult<()> {
        let (session, bot) = self.locked_bot().await?;
        let result = bot
            .detach_volume(vol)
            .await
            .with_context(|| format!("detach volume {}", vol.mount_dir));
        session.finish().await;
        result?;

        if self.meta.drop_vol(self.rt.store.as_ref(), &vol.id)?.is_some() {
            tracing::info!(guest_id = %self.meta.id, mount_dir = %vol.mount_dir, "Detached volume");
        }
        Ok(())
    }

    async fn resize_gpu(&mut self, requested: &GpuParams) -> GuestvisorResult<()> {
        let add = gpu_diff(requested, &self.meta.gpu);
        let sub = gpu_diff(&self.meta.gpu, requested);
        if add.is_empty() && sub.is_empty() {
            return Ok(());
        }

        let (session, bot) = self.locked_bot().await?;
        let result: GuestvisorResult<()> = async {
            if !add.is_empty() {
                bot.attach_gpus(&add).await.context("attach gpus")?;
            }
            if !sub.is_empty() {
                bot.detach_gpus(&sub).await.context("detach gpus")?;
            }
            Ok(())
        }
        .await;
        session.finish().await;
        result?;

        self.meta.gpu = requested.clone();
        self.save()
    }

    async fn resize_spec(&mut self, cpu: u32, memory: u64) -> GuestvisorResult<()> {
        let config = &self.rt.config;
        if cpu < config.min_cpu || cpu > config.max_cpu {
            return Err(GuestvisorError::InvalidArgument(format!(
                "invalid cpu num: {}, it should be [{}, {}]",
                cpu, config.min_cpu, config.max_cpu
            )));
        }
        if memory < config.min_memory || memory > config.max_memory {
            return Err(GuestvisorError::InvalidArgument(format!(
                "invalid memory: {}, it should be [{}, {}]",
                memory, config.min_memory, config.max_memory
            )));
        }

        let (session, bot) = self.locked_bot().await?;
        let result = bot.resize(cpu, memory).await.context("resize domain");
        session.finish().await;
        result?;

        self.meta.cpu = cpu;
        self.meta.memory = memory;
        self.save()
    }
}
