use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use guestvisor_shared::constants::keys;
use guestvisor_shared::{GuestvisorError, GuestvisorResult, ResultExt};

use super::meta::{self, Resource};
use super::status::{Lifecycle, Status};
use super::volume::{Volume, Volumes};
use crate::config::VirtConfig;
use crate::store::Store;

/// GPU product name to device count.
pub type GpuParams = BTreeMap<String, u32>;

/// A network joined in addition to the primary one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraNetwork {
    pub mode: String,
    pub name: String,
    pub cidr: String,
}

/// Command run once inside a lambda guest after boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LambdaOptions {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub output: Vec<u8>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub pid: i32,
}

/// Persisted guest record.
///
/// Stored at `/guests/<id>`, with an index entry at `/hosts/<host>/guests/<id>`.
/// Volumes are stored separately and referenced by `vol_ids`; `vols` holds
/// them once loaded and is kept index-aligned with `vol_ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(skip)]
    pub version: u64,

    pub image_name: String,
    pub host_name: String,
    pub cpu: u32,
    /// Bytes.
    pub memory: u64,
    #[serde(default)]
    pub vol_ids: Vec<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_networks: Vec<ExtraNetwork>,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gpu: GpuParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lambda: Option<LambdaOptions>,
    #[serde(default)]
    pub lambda_stdin: bool,

    #[serde(skip)]
    pub vols: Volumes,
}

impl Guest {
    pub fn new(host_name: impl Into<String>, image_name: impl Into<String>, cpu: u32, memory: u64) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            status: None,
            created_at: Utc::now().timestamp(),
            updated_at: 0,
            version: 0,
            image_name: image_name.into(),
            host_name: host_name.into(),
            cpu,
            memory,
            vol_ids: Vec::new(),
            ips: Vec::new(),
            extra_networks: Vec::new(),
            mac: String::new(),
            labels: BTreeMap::new(),
            gpu: GpuParams::new(),
            lambda: None,
            lambda_stdin: false,
            vols: Volumes::new(),
        }
    }

    /// Validate resource ranges against the host configuration.
    pub fn check(&self, config: &VirtConfig) -> GuestvisorResult<()> {
        if self.cpu < config.min_cpu || self.cpu > config.max_cpu {
            return Err(GuestvisorError::InvalidArgument(format!(
                "invalid cpu num: {}, it should be [{}, {}]",
                self.cpu, config.min_cpu, config.max_cpu
            )));
        }
        if self.memory < config.min_memory || self.memory > config.max_memory {
            return Err(GuestvisorError::InvalidArgument(format!(
                "invalid memory: {}, it should be [{}, {}]",
                self.memory, config.min_memory, config.max_memory
            )));
        }
        if self.vols.len() > config.max_volumes_count {
            return Err(GuestvisorError::TooManyVolumes(config.max_volumes_count));
        }
        let mut mounts = std::collections::HashSet::new();
        for vol in self.vols.iter().filter(|v| !v.sys) {
            if !mounts.insert(vol.mount_dir.as_str()) {
                return Err(GuestvisorError::InvalidArgument(format!(
                    "duplicate mount dir: {}",
                    vol.mount_dir
                )));
            }
        }
        Ok(())
    }

    pub fn host_guest_key(&self) -> String {
        keys::host_guest(&self.host_name, &self.id)
    }

    /// Insert the guest, its volumes and the host index entry.
    pub fn create(&mut self, store: &dyn Store) -> GuestvisorResult<()> {
        self.set_status(Status::Pending, false)?;
        for vol in self.vols.iter_mut() {
            vol.guest_id = self.id.clone();
            vol.host_name = self.host_name.clone();
            vol.set_status(Status::Pending, false)?;
        }
        self.vol_ids = self.vols.iter().map(|v| v.id.clone()).collect();

        let marker = self.host_guest_key();
        self.with_all_resources(|resources| meta::create(store, resources, &[marker]))
    }

    /// Load a guest and every volume it references.
    pub fn load(store: &dyn Store, id: &str) -> GuestvisorResult<Self> {
        let (mut guest, version): (Guest, u64) =
            meta::load(store, &keys::guest(id)).with_context(|| format!("load guest {}", id))?;
        guest.version = version;

        let mut vols = Volumes::with_capacity(guest.vol_ids.len());
        for vol_id in &guest.vol_ids {
            let (mut vol, version): (Volume, u64) = meta::load(store, &keys::volume(vol_id))
                .with_context(|| format!("load volume {}", vol_id))?;
            vol.version = version;
            vols.push(vol);
        }
        guest.vols = vols;
        Ok(guest)
    }

    /// Persist the guest record alone.
    pub fn save(&mut self, store: &dyn Store) -> GuestvisorResult<()> {
        meta::save(store, &mut [self as &mut dyn Resource])
    }

    /// Persist the guest and all of its volumes in one transaction.
    pub fn save_all(&mut self, store: &dyn Store) -> GuestvisorResult<()> {
        self.with_all_resources(|resources| meta::save(store, resources))
    }

    /// Persist the guest together with one of its volumes that is not stored yet.
    pub fn save_with_new_vol(&mut self, store: &dyn Store, vol_id: &str) -> GuestvisorResult<()> {
        let mut vols = std::mem::take(&mut self.vols);
        let result = match vols.iter_mut().find(|v| v.id == vol_id) {
            Some(vol) => meta::save_with_new(
                store,
                &mut [self as &mut dyn Resource],
                &mut [vol as &mut dyn Resource],
            ),
            None => Err(GuestvisorError::NotFound(format!("volume {}", vol_id))),
        };
        self.vols = vols;
        result
    }

    /// Move the guest and every volume to `next`, then persist them together.
    pub fn forward_status(&mut self, store: &dyn Store, next: Status, force: bool) -> GuestvisorResult<()> {
        self.set_status(next, force)?;
        for vol in self.vols.iter_mut() {
            vol.set_status(next, force)?;
        }
        self.save_all(store)
    }

    /// Mark destroyed and remove every key owned by the guest.
    pub fn delete(&mut self, store: &dyn Store, force: bool) -> GuestvisorResult<()> {
        self.set_status(Status::Destroyed, force)?;
        for vol in self.vols.iter_mut() {
            vol.set_status(Status::Destroyed, force)?;
        }

        let mut resources: Vec<&dyn Resource> = vec![self as &dyn Resource];
        resources.extend(self.vols.iter().map(|v| v as &dyn Resource));
        meta::delete(store, &resources, &[self.host_guest_key()])
    }

    /// Add volumes, bounded by `max`.
    pub fn append_vols(&mut self, vols: Vec<Volume>, max: usize) -> GuestvisorResult<()> {
        if self.vols.len() + vols.len() > max {
            return Err(GuestvisorError::TooManyVolumes(max));
        }
        for mut vol in vols {
            vol.guest_id = self.id.clone();
            vol.host_name = self.host_name.clone();
            if vol.device.is_empty() {
                vol.device = self.next_device_name()?;
            }
            self.vol_ids.push(vol.id.clone());
            self.vols.push(vol);
        }
        Ok(())
    }

    pub fn remove_vol(&mut self, vol_id: &str) -> Option<Volume> {
        let idx = self.vols.iter().position(|v| v.id == vol_id)?;
        self.vol_ids.retain(|id| id != vol_id);
        Some(self.vols.remove(idx))
    }

    /// Remove a volume and persist the guest without it, deleting the volume
    /// record in the same transaction. On failure the volume is put back.
    pub fn drop_vol(&mut self, store: &dyn Store, vol_id: &str) -> GuestvisorResult<Option<Volume>> {
        let Some(vol_idx) = self.vols.iter().position(|v| v.id == vol_id) else {
            return Ok(None);
        };
        let id_idx = self.vol_ids.iter().position(|id| id == vol_id);
        let vol = self.vols.remove(vol_idx);
        if let Some(idx) = id_idx {
            self.vol_ids.remove(idx);
        }

        match meta::save_and_delete(store, &mut [self as &mut dyn Resource], &[&vol as &dyn Resource]) {
            Ok(()) => Ok(Some(vol)),
            Err(e) => {
                if let Some(idx) = id_idx {
                    self.vol_ids.insert(idx, vol.id.clone());
                }
                self.vols.insert(vol_idx, vol);
                Err(e)
            }
        }
    }

    /// First `vdX` device name not used by an attached volume.
    pub fn next_device_name(&self) -> GuestvisorResult<String> {
        (b'a'..=b'z')
            .map(|c| format!("vd{}", c as char))
            .find(|name| !self.vols.iter().any(|v| &v.device == name))
            .ok_or_else(|| GuestvisorError::InvalidState("no free device name".into()))
    }

    /// The data volume mounted at `mount_dir`.
    pub fn find_vol(&self, mount_dir: &str) -> Option<&Volume> {
        self.vols.iter().find(|v| !v.sys && v.mount_dir == mount_dir)
    }

    pub fn vol_by_id(&self, vol_id: &str) -> Option<&Volume> {
        self.vols.iter().find(|v| v.id == vol_id)
    }

    pub fn vol_by_id_mut(&mut self, vol_id: &str) -> Option<&mut Volume> {
        self.vols.iter_mut().find(|v| v.id == vol_id)
    }

    pub fn is_lambda(&self) -> bool {
        self.lambda.is_some()
    }

    /// Run `f` over the guest record followed by every volume record.
    fn with_all_resources<R>(&mut self, f: impl FnOnce(&mut [&mut dyn Resource]) -> R) -> R {
        let mut vols = std::mem::take(&mut self.vols);
        let result = {
            let mut resources: Vec<&mut dyn Resource> = Vec::with_capacity(vols.len() + 1);
            resources.push(self as &mut dyn Resource);
            resources.extend(vols.iter_mut().map(|v| v as &mut dyn Resource));
            f(&mut resources)
        };
        self.vols = vols;
        result
    }
}

/// Random MAC in the locally administered QEMU/KVM `52:54:00` range.
pub fn qemu_mac() -> String {
    let [a, b, c]: [u8; 3] = rand::random();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", a, b, c)
}

macro_rules! forward_helpers {
    ($($name:ident => $status:ident),* $(,)?) => {
        impl Guest {
            $(
                pub fn $name(&mut self, store: &dyn Store, force: bool) -> GuestvisorResult<()> {
                    self.forward_status(store, Status::$status, force)
                }
            )*
        }
    };
}

forward_helpers! {
    forward_creating => Creating,
    forward_starting => Starting,
    forward_running => Running,
    forward_stopping => Stopping,
    forward_stopped => Stopped,
    forward_pausing => Pausing,
    forward_paused => Paused,
    forward_resuming => Resuming,
    forward_resizing => Resizing,
    forward_migrating => Migrating,
    forward_capturing => Capturing,
    forward_captured => Captured,
    forward_destroying => Destroying,
}

impl Lifecycle for Guest {
    fn status(&self) -> Option<Status> {
        self.status
    }

    fn status_mut(&mut self) -> &mut Option<Status> {
        &mut self.status
    }
}

impl Resource for Guest {
    fn meta_key(&self) -> String {
        keys::guest(&self.id)
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn touch(&mut self, now: i64) {
        self.updated_at = now;
    }

    fn encode(&self) -> GuestvisorResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
