//! Daemon configuration.
//!
//! Loaded from a JSON file; every field has a default so an empty object is a
//! valid configuration. Durations are expressed in whole seconds.

use guestvisor_shared::{GuestvisorError, GuestvisorResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for the guest orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtConfig {
    /// Host this daemon manages guests for.
    pub host_name: String,
    pub libvirt_uri: String,

    pub virt_dir: PathBuf,
    /// Per-guest lock files live here. Empty means `<virt_dir>/flock`.
    pub flock_dir: PathBuf,
    /// Cloud-init ISOs (`<id>.iso`). Empty means `<virt_dir>/cloud-init`.
    pub cloud_init_dir: PathBuf,
    /// Guest agent sockets. Empty means `<virt_dir>/sock`.
    pub sock_dir: PathBuf,
    /// SQLite metadata database. Empty means `<virt_dir>/meta.db`.
    pub database_path: PathBuf,

    /// Deadline applied by the Manager to every serialized operation.
    #[serde(with = "secs")]
    pub virt_timeout: Duration,
    /// Upper bound for the guest agent to answer after boot.
    #[serde(with = "secs")]
    pub ga_boot_timeout: Duration,
    /// Agent poll backoff is `ga_backoff_unit * attempt`.
    #[serde(with = "secs")]
    pub ga_backoff_unit: Duration,
    /// Attempt number stops growing the backoff past this value.
    pub ga_backoff_cap: u32,
    /// Kept in reserve from the caller's deadline while waiting for the agent.
    #[serde(with = "secs")]
    pub ga_deadline_margin: Duration,
    #[serde(with = "secs")]
    pub graceful_timeout: Duration,

    pub min_cpu: u32,
    pub max_cpu: u32,
    pub min_memory: u64,
    pub max_memory: u64,
    pub max_volumes_count: usize,

    /// Host bridge guests are attached to.
    pub bridge: String,
    /// Inbound/outbound average in KiB/s; 0 disables limiting.
    pub bandwidth_kbps: u64,

    /// Commands executed inside the guest after every boot.
    pub batches: Vec<Batch>,

    pub log: LogConfig,
}

impl Default for VirtConfig {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            libvirt_uri: "qemu:///system".to_string(),
            virt_dir: PathBuf::from("/var/lib/guestvisor"),
            flock_dir: PathBuf::new(),
            cloud_init_dir: PathBuf::new(),
            sock_dir: PathBuf::new(),
            database_path: PathBuf::new(),
            virt_timeout: Duration::from_secs(3600),
            ga_boot_timeout: Duration::from_secs(600),
            ga_backoff_unit: Duration::from_secs(1),
            ga_backoff_cap: 9,
            ga_deadline_margin: Duration::from_secs(5),
            graceful_timeout: Duration::from_secs(20),
            min_cpu: 1,
            max_cpu: 112,
            min_memory: 512 * 1024 * 1024,
            max_memory: 1024 * 1024 * 1024 * 1024,
            max_volumes_count: 8,
            bridge: "virbr0".to_string(),
            bandwidth_kbps: 0,
            batches: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

impl VirtConfig {
    /// Read a configuration file.
    pub fn load(path: &Path) -> GuestvisorResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GuestvisorError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            GuestvisorError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Fill derived paths, validate ranges, and create runtime directories.
    pub fn prepare(mut self) -> GuestvisorResult<Self> {
        if self.host_name.is_empty() {
            self.host_name = nix::unistd::gethostname()
                .map_err(|e| GuestvisorError::Config(format!("failed to read hostname: {}", e)))?
                .to_string_lossy()
                .into_owned();
        }
        if self.flock_dir.as_os_str().is_empty() {
            self.flock_dir = self.virt_dir.join("flock");
        }
        if self.cloud_init_dir.as_os_str().is_empty() {
            self.cloud_init_dir = self.virt_dir.join("cloud-init");
        }
        if self.sock_dir.as_os_str().is_empty() {
            self.sock_dir = self.virt_dir.join("sock");
        }
        if self.database_path.as_os_str().is_empty() {
            self.database_path = self.virt_dir.join("meta.db");
        }

        self.validate()?;

        for dir in [&self.flock_dir, &self.cloud_init_dir, &self.sock_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                GuestvisorError::Config(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }

        Ok(self)
    }

    fn validate(&self) -> GuestvisorResult<()> {
        if self.min_cpu == 0 || self.min_cpu > self.max_cpu {
            return Err(GuestvisorError::Config(format!(
                "invalid cpu range [{}, {}]",
                self.min_cpu, self.max_cpu
            )));
        }
        if self.min_memory > self.max_memory {
            return Err(GuestvisorError::Config(format!(
                "invalid memory range [{}, {}]",
                self.min_memory, self.max_memory
            )));
        }
        if self.virt_timeout.is_zero() {
            return Err(GuestvisorError::Config("virt_timeout must be positive".into()));
        }
        Ok(())
    }

    /// Path of the cloud-init ISO generated for a guest.
    pub fn cloud_init_iso(&self, guest_id: &str) -> PathBuf {
        self.cloud_init_dir.join(format!("{}.iso", guest_id))
    }

    /// Path of the guest agent socket.
    pub fn agent_socket(&self, guest_id: &str) -> PathBuf {
        self.sock_dir.join(format!("{}.sock", guest_id))
    }
}

/// A group of commands executed through the guest agent after boot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Batch {
    /// Each entry is a command line, split on whitespace.
    pub bins: Vec<String>,
    /// When set, the batch only runs while this file is absent in the guest,
    /// and the file is created afterwards.
    pub flag_file: String,
    /// A failure of a `force_ok` batch stops the remaining batches.
    pub force_ok: bool,
    #[serde(with = "secs")]
    pub timeout: Duration,
    pub retry: bool,
    #[serde(with = "secs")]
    pub interval: Duration,
}

impl Batch {
    pub fn is_run_once(&self) -> bool {
        !self.flag_file.is_empty()
    }

    /// Split every entry into program and arguments.
    pub fn commands(&self) -> GuestvisorResult<Vec<Vec<String>>> {
        self.bins
            .iter()
            .map(|bin| {
                let parts: Vec<String> = bin.split_whitespace().map(str::to_string).collect();
                if parts.is_empty() {
                    return Err(GuestvisorError::InvalidArgument(format!(
                        "invalid command: {:?}",
                        bin
                    )));
                }
                Ok(parts)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset.
    pub level: String,
    /// Daily-rolling log directory. Logs go to stderr when unset.
    pub dir: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            ansi: true,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
