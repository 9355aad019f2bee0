//! Bot backed by the `virsh` and `qemu-img` command line tools.
//!
//! Guest agent calls go through `virsh qemu-agent-command`. Every process is
//! spawned per call, so closing a bot only has to release the host lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use tokio::process::Command;

use guestvisor_shared::{GuestvisorError, GuestvisorResult, ResultExt};

use super::flock::GuestLock;
use super::{Bot, BotFactory, DomainState, ExecOutput, Rollback, Snapshot};
use crate::config::{Batch, VirtConfig};
use crate::models::{ExtraNetwork, GpuParams, Guest, Volume, VolumeFormat};

const AGENT_TIMEOUT_SECS: u64 = 30;
const FILE_CHUNK: usize = 48 * 1024;
const EXEC_POLL: Duration = Duration::from_millis(200);
const RBD_POOL: &str = "guestvisor";

pub struct VirshBotFactory {
    config: Arc<VirtConfig>,
}

impl VirshBotFactory {
    pub fn new(config: Arc<VirtConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BotFactory for VirshBotFactory {
    async fn open(&self, guest: &Guest) -> GuestvisorResult<Box<dyn Bot>> {
        Ok(Box::new(VirshBot::new(Arc::clone(&self.config), guest)))
    }

    async fn list_domains(&self) -> GuestvisorResult<Vec<String>> {
        let out = run(
            "virsh",
            &["-c", &self.config.libvirt_uri, "list", "--all", "--name"],
            None,
        )
        .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

pub struct VirshBot {
    config: Arc<VirtConfig>,
    guest_id: String,
    lock: GuestLock,
    sys_volume: Option<Volume>,
}

impl VirshBot {
    pub fn new(config: Arc<VirtConfig>, guest: &Guest) -> Self {
        let lock = GuestLock::new(&config.flock_dir, &guest.id);
        Self {
            sys_volume: guest.vols.iter().find(|v| v.sys).cloned(),
            guest_id: guest.id.clone(),
            lock,
            config,
        }
    }

    async fn virsh(&self, args: &[&str]) -> GuestvisorResult<String> {
        let mut full = vec!["-c", self.config.libvirt_uri.as_str()];
        full.extend_from_slice(args);
        run("virsh", &full, Some(&self.guest_id)).await
    }

    async fn qemu_img(&self, args: &[&str]) -> GuestvisorResult<String> {
        run("qemu-img", args, Some(&self.guest_id)).await
    }

    /// Send a guest agent command, returning its `return` member.
    async fn agent(&self, command: Value) -> GuestvisorResult<Value> {
        let payload = command.to_string();
        let timeout = AGENT_TIMEOUT_SECS.to_string();
        let out = self
            .virsh(&[
                "qemu-agent-command",
                &self.guest_id,
                &payload,
                "--timeout",
                &timeout,
            ])
            .await?;
        let mut reply: Value = serde_json::from_str(&out)?;
        match reply.get_mut("return") {
            Some(ret) => Ok(ret.take()),
            None => Err(GuestvisorError::Hypervisor(format!(
                "unexpected agent reply: {}",
                out
            ))),
        }
    }

    fn image_path(&self, image_name: &str) -> PathBuf {
        self.config
            .virt_dir
            .join("images")
            .join(format!("{}.qcow2", image_name))
    }

    fn vol_path(&self, vol: &Volume) -> String {
        match vol.format {
            VolumeFormat::Local => self
                .config
                .virt_dir
                .join("volumes")
                .join(format!("{}.qcow2", vol.id))
                .to_string_lossy()
                .into_owned(),
            VolumeFormat::Rbd => format!("rbd:{}/{}", RBD_POOL, vol.id),
        }
    }

    async fn ensure_volume(&self, vol: &Volume) -> GuestvisorResult<()> {
        let path = self.vol_path(vol);
        if vol.format == VolumeFormat::Local {
            if tokio::fs::try_exists(&path).await? {
                return Ok(());
            }
            if let Some(parent) = PathBuf::from(&path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let size = vol.size.to_string();
        match &vol.image_name {
            Some(image) if vol.sys => {
                let backing = self.image_path(image).to_string_lossy().into_owned();
                self.qemu_img(&["create", "-f", "qcow2", "-F", "qcow2", "-b", &backing, &path, &size])
                    .await?;
            }
            _ => {
                self.qemu_img(&["create", "-f", "qcow2", &path, &size]).await?;
            }
        }
        Ok(())
    }

    /// `--live` is only accepted while the domain runs.
    async fn device_flags(&self) -> GuestvisorResult<Vec<&'static str>> {
        let mut flags = vec!["--persistent"];
        if self.state().await?.is_running() {
            flags.push("--live");
        }
        Ok(flags)
    }

    async fn guest_exec(&self, cmd: &[String], timeout: Option<Duration>) -> GuestvisorResult<ExecOutput> {
        let (path, args) = cmd
            .split_first()
            .ok_or_else(|| GuestvisorError::InvalidArgument("empty command".into()))?;
        let ret = self
            .agent(json!({
                "execute": "guest-exec",
                "arguments": {"path": path, "arg": args, "capture-output": true},
            }))
            .await?;
        let pid = ret
            .get("pid")
            .and_then(Value::as_i64)
            .ok_or_else(|| GuestvisorError::Hypervisor("guest-exec returned no pid".into()))?;

        let started = tokio::time::Instant::now();
        loop {
            let status = self
                .agent(json!({"execute": "guest-exec-status", "arguments": {"pid": pid}}))
                .await?;
            if status.get("exited").and_then(Value::as_bool).unwrap_or(false) {
                let mut output = decode_field(&status, "out-data")?;
                output.extend(decode_field(&status, "err-data")?);
                return Ok(ExecOutput {
                    output,
                    exit_code: status.get("exitcode").and_then(Value::as_i64).unwrap_or(-1) as i32,
                    pid: pid as i32,
                });
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(GuestvisorError::Timeout(limit));
                }
            }
            tokio::time::sleep(EXEC_POLL).await;
        }
    }

    async fn guest_sh(&self, script: &str) -> GuestvisorResult<ExecOutput> {
        let cmd = ["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
        let out = self.guest_exec(&cmd, None).await?;
        if out.exit_code != 0 {
            return Err(GuestvisorError::Hypervisor(format!(
                "`{}` exited with {}: {}",
                script,
                out.exit_code,
                String::from_utf8_lossy(&out.output).trim()
            )));
        }
        Ok(out)
    }

    async fn guest_file_exists(&self, path: &str) -> GuestvisorResult<bool> {
        let out = self
            .guest_exec(&["test".into(), "-e".into(), path.to_string()], None)
            .await?;
        Ok(out.exit_code == 0)
    }

    async fn run_batch_command(&self, batch: &Batch, cmd: &[String]) -> GuestvisorResult<()> {
        let timeout = (!batch.timeout.is_zero()).then_some(batch.timeout);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let result = match self.guest_exec(cmd, timeout).await {
                Ok(out) if out.exit_code == 0 => Ok(()),
                Ok(out) => Err(GuestvisorError::Hypervisor(format!(
                    "{:?} exited with {}",
                    cmd, out.exit_code
                ))),
                Err(e) => Err(e),
            };
            let expired = deadline.is_some_and(|d| tokio::time::Instant::now() >= d);
            match result {
                Err(e) if batch.retry && !expired => {
                    tracing::debug!(guest_id = %self.guest_id, error = %e, "Retrying batch command");
                    tokio::time::sleep(batch.interval.max(Duration::from_secs(1))).await;
                }
                other => return other,
            }
        }
    }

    async fn snapshot_names(&self, vol: &Volume) -> GuestvisorResult<Vec<(String, i64)>> {
        let path = self.vol_path(vol);
        let out = self.qemu_img(&["info", "--output=json", "-U", &path]).await?;
        let info: Value = serde_json::from_str(&out)?;
        let snaps = info
            .get("snapshots")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|s| {
                        let name = s.get("name")?.as_str()?.to_string();
                        let sec = s.get("date-sec").and_then(Value::as_i64).unwrap_or(0);
                        Some((name, sec))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(snaps)
    }
}

#[async_trait]
impl Bot for VirshBot {
    fn guest_id(&self) -> &str {
        &self.guest_id
    }

    fn try_lock(&self) -> GuestvisorResult<()> {
        self.lock.try_lock()
    }

    fn unlock(&self) {
        self.lock.unlock();
    }

    async fn close(&self) -> GuestvisorResult<()> {
        Ok(())
    }

    async fn define(&self, guest: &Guest) -> GuestvisorResult<()> {
        for vol in &guest.vols {
            self.ensure_volume(vol)
                .await
                .with_context(|| format!("create volume {}", vol.id))?;
        }

        let xml = domain_xml(&self.config, guest, |v| self.vol_path(v));
        let path = self.config.virt_dir.join(format!("{}.xml", guest.id));
        tokio::fs::write(&path, xml).await?;
        self.virsh(&["define", &path.to_string_lossy()]).await?;
        Ok(())
    }

    async fn undefine(&self) -> GuestvisorResult<()> {
        self.virsh(&["undefine", &self.guest_id, "--nvram"]).await?;
        let xml = self.config.virt_dir.join(format!("{}.xml", self.guest_id));
        if let Err(e) = tokio::fs::remove_file(&xml).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn state(&self) -> GuestvisorResult<DomainState> {
        let out = self.virsh(&["domstate", &self.guest_id]).await?;
        parse_domain_state(&out)
    }

    async fn boot(&self) -> GuestvisorResult<()> {
        self.virsh(&["start", &self.guest_id]).await.map(|_| ())
    }

    async fn shutdown(&self, force: bool) -> GuestvisorResult<()> {
        if self.state().await?.is_stopped() {
            return Ok(());
        }
        if force {
            return self.virsh(&["destroy", &self.guest_id]).await.map(|_| ());
        }

        self.virsh(&["shutdown", &self.guest_id]).await?;
        let deadline = tokio::time::Instant::now() + self.config.graceful_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.state().await?.is_stopped() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tracing::warn!(guest_id = %self.guest_id, "Graceful shutdown timed out, destroying");
        self.virsh(&["destroy", &self.guest_id]).await.map(|_| ())
    }

    async fn suspend(&self) -> GuestvisorResult<()> {
        self.virsh(&["suspend", &self.guest_id]).await.map(|_| ())
    }

    async fn resume(&self) -> GuestvisorResult<()> {
        self.virsh(&["resume", &self.guest_id]).await.map(|_| ())
    }

    async fn resize(&self, cpu: u32, memory: u64) -> GuestvisorResult<()> {
        let cpu = cpu.to_string();
        let kib = format!("{}", memory / 1024);
        self.virsh(&["setvcpus", &self.guest_id, &cpu, "--maximum", "--config"])
            .await?;
        self.virsh(&["setvcpus", &self.guest_id, &cpu, "--config"]).await?;
        self.virsh(&["setmaxmem", &self.guest_id, &kib, "--config"]).await?;
        self.virsh(&["setmem", &self.guest_id, &kib, "--config"]).await?;
        Ok(())
    }

    async fn migrate(&self) -> GuestvisorResult<()> {
        Err(GuestvisorError::Unsupported("live migration".into()))
    }

    async fn capture(&self, name: &str) -> GuestvisorResult<String> {
        let vol = self
            .sys_volume
            .as_ref()
            .ok_or_else(|| GuestvisorError::InvalidState(format!("{} has no system volume", self.guest_id)))?;
        let dest = self.image_path(name).to_string_lossy().into_owned();
        let src = self.vol_path(vol);
        self.qemu_img(&["convert", "-O", "qcow2", &src, &dest]).await?;
        Ok(dest)
    }

    async fn uuid(&self) -> GuestvisorResult<String> {
        self.virsh(&["domuuid", &self.guest_id]).await
    }

    async fn ping_agent(&self) -> GuestvisorResult<()> {
        self.agent(json!({"execute": "guest-ping"})).await.map(|_| ())
    }

    async fn reload_agent(&self) -> GuestvisorResult<()> {
        let id: u32 = rand::random();
        let ret = self
            .agent(json!({"execute": "guest-sync", "arguments": {"id": id}}))
            .await?;
        if ret.as_u64() != Some(u64::from(id)) {
            return Err(GuestvisorError::Hypervisor("guest agent out of sync".into()));
        }
        Ok(())
    }

    async fn setup_nics(&self, guest: &Guest) -> GuestvisorResult<()> {
        for ip in &guest.ips {
            self.guest_sh(&format!("ip addr replace {} dev eth0", ip)).await?;
        }
        self.guest_sh("ip link set eth0 up").await.map(|_| ())
    }

    async fn mount_volume(&self, vol: &Volume) -> GuestvisorResult<()> {
        if vol.sys {
            return Ok(());
        }
        let dev = shell_quote(&format!("/dev/{}", vol.device));
        let dir = shell_quote(&vol.mount_dir);
        let script = format!(
            "blkid {dev} >/dev/null || mkfs.ext4 -q {dev}; mkdir -p {dir}; \
             mountpoint -q {dir} || mount {dev} {dir}"
        );
        self.guest_sh(&script).await.map(|_| ())
    }

    async fn exec_batch(&self, batch: &Batch) -> GuestvisorResult<()> {
        if batch.is_run_once() && self.guest_file_exists(&batch.flag_file).await? {
            return Ok(());
        }
        for cmd in batch.commands()? {
            self.run_batch_command(batch, &cmd).await?;
        }
        if batch.is_run_once() {
            self.write_file(&batch.flag_file, b"", true).await?;
        }
        Ok(())
    }

    async fn bind_extra_network(&self, network: &ExtraNetwork) -> GuestvisorResult<()> {
        let name = shell_quote(&network.name);
        let cidr = shell_quote(&network.cidr);
        self.guest_sh(&format!("ip link set {name} up && ip addr replace {cidr} dev {name}"))
            .await
            .map(|_| ())
    }

    async fn unbind_extra_network(&self, network: &ExtraNetwork) -> GuestvisorResult<()> {
        let name = shell_quote(&network.name);
        self.guest_sh(&format!("ip addr flush dev {name} && ip link set {name} down"))
            .await
            .map(|_| ())
    }

    async fn execute_command(&self, cmd: &[String]) -> GuestvisorResult<ExecOutput> {
        self.guest_exec(cmd, None).await
    }

    async fn read_file(&self, path: &str) -> GuestvisorResult<Vec<u8>> {
        let handle = self
            .agent(json!({"execute": "guest-file-open", "arguments": {"path": path, "mode": "r"}}))
            .await?;
        let mut content = Vec::new();
        let result = async {
            loop {
                let chunk = self
                    .agent(json!({
                        "execute": "guest-file-read",
                        "arguments": {"handle": handle, "count": FILE_CHUNK},
                    }))
                    .await?;
                content.extend(decode_field(&chunk, "buf-b64")?);
                if chunk.get("eof").and_then(Value::as_bool).unwrap_or(true) {
                    return Ok::<(), GuestvisorError>(());
                }
            }
        }
        .await;
        self.agent(json!({"execute": "guest-file-close", "arguments": {"handle": handle}}))
            .await?;
        result.map(|_| content)
    }

    async fn write_file(&self, path: &str, content: &[u8], overwrite: bool) -> GuestvisorResult<()> {
        if !overwrite && self.guest_file_exists(path).await? {
            return Err(GuestvisorError::InvalidArgument(format!("{} already exists", path)));
        }
        let handle = self
            .agent(json!({"execute": "guest-file-open", "arguments": {"path": path, "mode": "w"}}))
            .await?;
        let mut result = Ok(());
        for chunk in content.chunks(FILE_CHUNK) {
            result = self
                .agent(json!({
                    "execute": "guest-file-write",
                    "arguments": {"handle": handle, "buf-b64": BASE64.encode(chunk)},
                }))
                .await
                .map(|_| ());
            if result.is_err() {
                break;
            }
        }
        self.agent(json!({"execute": "guest-file-close", "arguments": {"handle": handle}}))
            .await?;
        result
    }

    async fn fs_freeze_all(&self) -> GuestvisorResult<u32> {
        let ret = self.agent(json!({"execute": "guest-fsfreeze-freeze"})).await?;
        Ok(ret.as_u64().unwrap_or(0) as u32)
    }

    async fn fs_thaw_all(&self) -> GuestvisorResult<u32> {
        let ret = self.agent(json!({"execute": "guest-fsfreeze-thaw"})).await?;
        Ok(ret.as_u64().unwrap_or(0) as u32)
    }

    async fn fs_freeze_status(&self) -> GuestvisorResult<String> {
        let ret = self.agent(json!({"execute": "guest-fsfreeze-status"})).await?;
        Ok(ret.as_str().unwrap_or_default().to_string())
    }

    async fn attach_gpus(&self, _gpus: &GpuParams) -> GuestvisorResult<()> {
        Err(GuestvisorError::Unsupported("gpu passthrough".into()))
    }

    async fn detach_gpus(&self, _gpus: &GpuParams) -> GuestvisorResult<()> {
        Err(GuestvisorError::Unsupported("gpu passthrough".into()))
    }

    async fn attach_volume(&self, vol: &Volume) -> GuestvisorResult<Option<Rollback>> {
        self.ensure_volume(vol).await?;
        let path = self.vol_path(vol);

        let rollback: Option<Rollback> = (vol.format == VolumeFormat::Local).then(|| {
            let path = path.clone();
            let rollback: Rollback = Box::pin(async move {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path, error = %e, "Failed to remove volume file");
                }
            });
            rollback
        });

        let mut args = vec![
            "attach-disk",
            self.guest_id.as_str(),
            path.as_str(),
            vol.device.as_str(),
            "--driver",
            "qemu",
            "--subdriver",
            "qcow2",
        ];
        let flags = match self.device_flags().await {
            Ok(flags) => flags,
            Err(e) => return fail_with_rollback(e, rollback).await,
        };
        args.extend(flags);

        match self.virsh(&args).await {
            Ok(_) => Ok(rollback),
            Err(e) => fail_with_rollback(e, rollback).await,
        }
    }

    async fn detach_volume(&self, vol: &Volume) -> GuestvisorResult<()> {
        let mut args = vec!["detach-disk", self.guest_id.as_str(), vol.device.as_str()];
        args.extend(self.device_flags().await?);
        self.virsh(&args).await.map(|_| ())
    }

    async fn amplify_volume(&self, vol: &Volume, delta: u64) -> GuestvisorResult<()> {
        if self.state().await?.is_running() {
            let size = format!("{}B", vol.size + delta);
            return self
                .virsh(&["blockresize", &self.guest_id, &vol.device, &size])
                .await
                .map(|_| ());
        }
        let path = self.vol_path(vol);
        let grow = format!("+{}", delta);
        self.qemu_img(&["resize", &path, &grow]).await.map(|_| ())
    }

    async fn undefine_volume(&self, vol: &Volume) -> GuestvisorResult<()> {
        match vol.format {
            VolumeFormat::Local => match tokio::fs::remove_file(self.vol_path(vol)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
            VolumeFormat::Rbd => {
                let image = format!("{}/{}", RBD_POOL, vol.id);
                run("rbd", &["rm", &image], Some(&self.guest_id)).await.map(|_| ())
            }
        }
    }

    async fn check_volume(&self, vol: &Volume) -> GuestvisorResult<()> {
        let path = self.vol_path(vol);
        self.qemu_img(&["check", "-q", &path]).await.map(|_| ())
    }

    async fn repair_volume(&self, vol: &Volume) -> GuestvisorResult<()> {
        let path = self.vol_path(vol);
        self.qemu_img(&["check", "-q", "-r", "all", &path]).await.map(|_| ())
    }

    async fn create_snapshot(&self, vol: &Volume) -> GuestvisorResult<()> {
        let path = self.vol_path(vol);
        let name = format!("{}-{}", vol.id, Utc::now().format("%Y%m%d%H%M%S"));
        self.qemu_img(&["snapshot", "-c", &name, &path]).await.map(|_| ())
    }

    async fn commit_snapshot(&self, vol: &Volume, snap_id: &str) -> GuestvisorResult<()> {
        let path = self.vol_path(vol);
        self.qemu_img(&["snapshot", "-d", snap_id, &path]).await.map(|_| ())
    }

    async fn commit_snapshot_by_day(&self, vol: &Volume, day: u32) -> GuestvisorResult<()> {
        let cutoff = (Utc::now() - ChronoDuration::days(i64::from(day))).timestamp();
        let path = self.vol_path(vol);
        for (name, created) in self.snapshot_names(vol).await? {
            if created < cutoff {
                self.qemu_img(&["snapshot", "-d", &name, &path]).await?;
            }
        }
        Ok(())
    }

    async fn restore_snapshot(&self, vol: &Volume, snap_id: &str) -> GuestvisorResult<()> {
        let path = self.vol_path(vol);
        self.qemu_img(&["snapshot", "-a", snap_id, &path]).await.map(|_| ())
    }

    async fn list_snapshots(&self, vol: &Volume) -> GuestvisorResult<Vec<Snapshot>> {
        Ok(self
            .snapshot_names(vol)
            .await?
            .into_iter()
            .map(|(id, created_at)| Snapshot { id, created_at })
            .collect())
    }
}

/// Run a tool and return its trimmed stdout.
async fn run(program: &str, args: &[&str], guest_id: Option<&str>) -> GuestvisorResult<String> {
    tracing::trace!(program, ?args, "Running command");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| GuestvisorError::Hypervisor(format!("failed to spawn {}: {}", program, e)))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if let Some(id) = guest_id {
        if is_missing_domain(&stderr) {
            return Err(GuestvisorError::DomainNotExists(id.to_string()));
        }
    }
    Err(GuestvisorError::Hypervisor(format!(
        "{} {}: {}",
        program,
        args.iter().find(|a| !a.starts_with('-')).copied().unwrap_or_default(),
        stderr
    )))
}

/// Single-quotes a value for interpolation into a guest shell script.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

async fn fail_with_rollback<T>(err: GuestvisorError, rollback: Option<Rollback>) -> GuestvisorResult<T> {
    if let Some(rollback) = rollback {
        rollback.await;
    }
    Err(err)
}

fn decode_field(value: &Value, field: &str) -> GuestvisorResult<Vec<u8>> {
    match value.get(field).and_then(Value::as_str) {
        Some(data) => BASE64
            .decode(data)
            .map_err(|e| GuestvisorError::Hypervisor(format!("invalid {}: {}", field, e))),
        None => Ok(Vec::new()),
    }
}

fn parse_domain_state(raw: &str) -> GuestvisorResult<DomainState> {
    let state = match raw.trim() {
        "running" => DomainState::Running,
        "idle" | "blocked" => DomainState::Blocked,
        "paused" => DomainState::Paused,
        "in shutdown" => DomainState::ShuttingDown,
        "shut off" => DomainState::Shutoff,
        "crashed" => DomainState::Crashed,
        "pmsuspended" => DomainState::PmSuspended,
        "no state" => DomainState::NoState,
        other => {
            return Err(GuestvisorError::Hypervisor(format!(
                "unknown domain state: {:?}",
                other
            )));
        }
    };
    Ok(state)
}

fn domain_xml(config: &VirtConfig, guest: &Guest, vol_path: impl Fn(&Volume) -> String) -> String {
    let mut disks = String::new();
    for vol in &guest.vols {
        disks.push_str(&format!(
            "    <disk type='file' device='disk'>\n      \
             <driver name='qemu' type='qcow2'/>\n      \
             <source file='{}'/>\n      \
             <target dev='{}' bus='virtio'/>\n    </disk>\n",
            vol_path(vol),
            vol.device
        ));
    }

    let mac = if guest.mac.is_empty() {
        String::new()
    } else {
        format!("\n      <mac address='{}'/>", guest.mac)
    };

    format!(
        "<domain type='kvm'>\n  \
         <name>{id}</name>\n  \
         <memory unit='KiB'>{mem}</memory>\n  \
         <vcpu>{cpu}</vcpu>\n  \
         <os><type arch='x86_64'>hvm</type><boot dev='hd'/></os>\n  \
         <devices>\n{disks}    \
         <disk type='file' device='cdrom'>\n      \
         <source file='{iso}'/>\n      \
         <target dev='hdc' bus='sata'/>\n      <readonly/>\n    </disk>\n    \
         <interface type='bridge'>\n      <source bridge='{bridge}'/>{mac}\n      \
         <model type='virtio'/>\n    </interface>\n    \
         <channel type='unix'>\n      <source mode='bind' path='{sock}'/>\n      \
         <target type='virtio' name='org.qemu.guest_agent.0'/>\n    </channel>\n  \
         </devices>\n</domain>\n",
        id = guest.id,
        mem = guest.memory / 1024,
        cpu = guest.cpu,
        disks = disks,
        iso = config.cloud_init_iso(&guest.id).display(),
        bridge = config.bridge,
        mac = mac,
        sock = config.agent_socket(&guest.id).display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Volume;

    #[test]
    fn test_parse_domain_state() {
        assert_eq!(parse_domain_state("shut off\n").unwrap(), DomainState::Shutoff);
        assert_eq!(parse_domain_state("running").unwrap(), DomainState::Running);
        assert!(parse_domain_state("exploded").is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data"), "'/data'");
        assert_eq!(shell_quote("/d; rm -rf /"), "'/d; rm -rf /'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_missing_domain_detection() {
        assert!(is_missing_domain(
            "error: failed to get domain 'g1'\nerror: Domain not found"
        ));
        assert!(!is_missing_domain("error: internal error"));
    }

    #[test]
    fn test_domain_xml_lists_every_disk() {
        let config = VirtConfig::default();
        let mut guest = Guest::new("host1", "ubuntu", 2, 2 << 30);
        guest.mac = "52:54:00:00:00:01".into();
        guest
            .append_vols(
                vec![
                    Volume::new_sys(10 << 30, "ubuntu"),
                    Volume::new_data("/data", 1 << 30).unwrap(),
                ],
                8,
            )
            .unwrap();

        let xml = domain_xml(&config, &guest, |v| format!("/v/{}.qcow2", v.id));
        assert!(xml.contains(&format!("<name>{}</name>", guest.id)));
        assert!(xml.contains("<memory unit='KiB'>2097152</memory>"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<target dev='vdb' bus='virtio'/>"));
        assert!(xml.contains("<mac address='52:54:00:00:00:01'/>"));
    }

    #[test]
    fn test_decode_missing_field_is_empty() {
        let value = json!({"exited": true, "out-data": BASE64.encode("hi")});
        assert_eq!(decode_field(&value, "out-data").unwrap(), b"hi");
        assert!(decode_field(&value, "err-data").unwrap().is_empty());
    }
}
