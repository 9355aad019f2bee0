use chrono::Utc;
use serde::{Deserialize, Serialize};

use guestvisor_shared::constants::keys;
use guestvisor_shared::{GuestvisorError, GuestvisorResult};

use super::meta::Resource;
use super::status::{Lifecycle, Status};

/// Backing storage of a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    #[default]
    Local,
    Rbd,
}

/// A disk attached to a guest.
///
/// Keyed at `/volumes/<id>`. The system volume has no mount directory; data
/// volumes are identified within a guest by theirs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(skip)]
    pub version: u64,

    #[serde(default)]
    pub guest_id: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub mount_dir: String,
    /// Capacity in bytes.
    pub size: u64,
    /// Target device inside the guest, e.g. `vdb`.
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub sys: bool,
    #[serde(default)]
    pub format: VolumeFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(default)]
    pub snap_ids: Vec<String>,
}

pub type Volumes = Vec<Volume>;

impl Volume {
    fn new(size: u64) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            status: None,
            created_at: Utc::now().timestamp(),
            updated_at: 0,
            version: 0,
            guest_id: String::new(),
            host_name: String::new(),
            mount_dir: String::new(),
            size,
            device: String::new(),
            sys: false,
            format: VolumeFormat::Local,
            image_name: None,
            snap_ids: Vec::new(),
        }
    }

    /// System disk built from an image.
    pub fn new_sys(size: u64, image_name: impl Into<String>) -> Self {
        let mut vol = Self::new(size);
        vol.sys = true;
        vol.image_name = Some(image_name.into());
        vol
    }

    /// Data disk mounted at `mount_dir` inside the guest.
    pub fn new_data(mount_dir: &str, size: u64) -> GuestvisorResult<Self> {
        let mount_dir = normalize_mount(mount_dir)?;
        if size == 0 {
            return Err(GuestvisorError::InvalidArgument(format!(
                "volume at {} must have a positive size",
                mount_dir
            )));
        }
        let mut vol = Self::new(size);
        vol.mount_dir = mount_dir;
        Ok(vol)
    }

    /// Parse a `<mount_dir>=<size>` request, size in bytes or with a
    /// `K`/`M`/`G`/`T` suffix.
    pub fn parse_request(spec: &str) -> GuestvisorResult<Self> {
        let (mount, size) = parse_mount_size(spec)?;
        Self::new_data(&mount, size)
    }
}

/// Split `<mount_dir>=<size>` into a normalized mount dir and a byte count.
/// A zero size is accepted here.
pub fn parse_mount_size(spec: &str) -> GuestvisorResult<(String, u64)> {
    let (mount, size) = spec.split_once('=').ok_or_else(|| {
        GuestvisorError::InvalidArgument(format!("invalid volume {:?}, want dir=size", spec))
    })?;
    Ok((normalize_mount(mount)?, parse_size(size)?))
}

fn normalize_mount(mount_dir: &str) -> GuestvisorResult<String> {
    let trimmed = mount_dir.trim().trim_end_matches('/');
    if !trimmed.starts_with('/') || trimmed.len() < 2 {
        return Err(GuestvisorError::InvalidArgument(format!(
            "invalid mount dir: {:?}",
            mount_dir
        )));
    }
    Ok(trimmed.to_string())
}

/// Parse `10G`, `512M`, `2048` into bytes.
pub fn parse_size(raw: &str) -> GuestvisorResult<u64> {
    let raw = raw.trim();
    let invalid = || GuestvisorError::InvalidArgument(format!("invalid size: {:?}", raw));
    let (digits, shift) = match raw.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&raw[..raw.len() - 1], 10),
        Some('M') => (&raw[..raw.len() - 1], 20),
        Some('G') => (&raw[..raw.len() - 1], 30),
        Some('T') => (&raw[..raw.len() - 1], 40),
        Some(_) => (raw, 0),
        None => return Err(invalid()),
    };
    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value.checked_shl(shift).filter(|v| v >> shift == value).ok_or_else(invalid)
}

impl Lifecycle for Volume {
    fn status(&self) -> Option<Status> {
        self.status
    }

    fn status_mut(&mut self) -> &mut Option<Status> {
        &mut self.status
    }
}

impl Resource for Volume {
    fn meta_key(&self) -> String {
        keys::volume(&self.id)
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
