//! Recording bot for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use guestvisor_shared::{GuestvisorError, GuestvisorResult};

use super::{Bot, BotFactory, DomainState, ExecOutput, Rollback, Snapshot};
use crate::config::Batch;
use crate::models::{ExtraNetwork, GpuParams, Guest, Volume};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Lock,
    Unlock,
    Close,
    Define,
    Undefine,
    State,
    Boot,
    Shutdown { force: bool },
    Suspend,
    Resume,
    Resize { cpu: u32, memory: u64 },
    Migrate,
    Capture(String),
    Uuid,
    PingAgent,
    ReloadAgent,
    SetupNics,
    MountVolume(String),
    ExecBatch(Vec<String>),
    BindExtraNetwork(String),
    UnbindExtraNetwork(String),
    ExecuteCommand(Vec<String>),
    ReadFile(String),
    WriteFile(String),
    FsFreezeAll,
    FsThawAll,
    FsFreezeStatus,
    AttachGpus(GpuParams),
    DetachGpus(GpuParams),
    AttachVolume(String),
    AttachRollback(String),
    DetachVolume(String),
    AmplifyVolume { mount_dir: String, delta: u64 },
    UndefineVolume(String),
    CheckVolume(String),
    RepairVolume(String),
    CreateSnapshot(String),
    CommitSnapshot(String, String),
    CommitSnapshotByDay(String, u32),
    RestoreSnapshot(String, String),
    ListSnapshots(String),
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Lock => "lock",
            Call::Unlock => "unlock",
            Call::Close => "close",
            Call::Define => "define",
            Call::Undefine => "undefine",
            Call::State => "state",
            Call::Boot => "boot",
            Call::Shutdown { .. } => "shutdown",
            Call::Suspend => "suspend",
            Call::Resume => "resume",
            Call::Resize { .. } => "resize",
            Call::Migrate => "migrate",
            Call::Capture(_) => "capture",
            Call::Uuid => "uuid",
            Call::PingAgent => "ping_agent",
            Call::ReloadAgent => "reload_agent",
            Call::SetupNics => "setup_nics",
            Call::MountVolume(_) => "mount_volume",
            Call::ExecBatch(_) => "exec_batch",
            Call::BindExtraNetwork(_) => "bind_extra_network",
            Call::UnbindExtraNetwork(_) => "unbind_extra_network",
            Call::ExecuteCommand(_) => "execute_command",
            Call::ReadFile(_) => "read_file",
            Call::WriteFile(_) => "write_file",
            Call::FsFreezeAll => "fs_freeze_all",
            Call::FsThawAll => "fs_thaw_all",
            Call::FsFreezeStatus => "fs_freeze_status",
            Call::AttachGpus(_) => "attach_gpus",
            Call::DetachGpus(_) => "detach_gpus",
            Call::AttachVolume(_) => "attach_volume",
            Call::AttachRollback(_) => "attach_rollback",
            Call::DetachVolume(_) => "detach_volume",
            Call::AmplifyVolume { .. } => "amplify_volume",
            Call::UndefineVolume(_) => "undefine_volume",
            Call::CheckVolume(_) => "check_volume",
            Call::RepairVolume(_) => "repair_volume",
            Call::CreateSnapshot(_) => "create_snapshot",
            Call::CommitSnapshot(..) => "commit_snapshot",
            Call::CommitSnapshotByDay(..) => "commit_snapshot_by_day",
            Call::RestoreSnapshot(..) => "restore_snapshot",
            Call::ListSnapshots(_) => "list_snapshots",
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: HashMap<String, Vec<Call>>,
    locks: HashSet<String>,
    domains: HashMap<String, DomainState>,
    missing: HashSet<String>,
    /// Call name to remaining failures, `None` meaning always.
    failures: HashMap<&'static str, Option<usize>>,
    delays: HashMap<&'static str, Duration>,
    snapshots: HashMap<String, Vec<Snapshot>>,
    files: HashMap<(String, String), Vec<u8>>,
}

/// Shared state behind every bot the factory hands out.
#[derive(Clone, Default)]
pub struct MockBotFactory {
    state: Arc<Mutex<MockState>>,
}

impl MockBotFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, guest_id: &str) -> Vec<Call> {
        self.state.lock().calls.get(guest_id).cloned().unwrap_or_default()
    }

    /// Calls other than lock bookkeeping, for asserting on side effects.
    pub fn effects(&self, guest_id: &str) -> Vec<Call> {
        self.calls(guest_id)
            .into_iter()
            .filter(|c| !matches!(c, Call::Lock | Call::Unlock | Call::Close | Call::State))
            .collect()
    }

    pub fn count(&self, guest_id: &str, name: &str) -> usize {
        self.calls(guest_id).iter().filter(|c| c.name() == name).count()
    }

    pub fn clear_calls(&self, guest_id: &str) {
        self.state.lock().calls.remove(guest_id);
    }

    pub fn set_domain_state(&self, guest_id: &str, state: DomainState) {
        self.state.lock().domains.insert(guest_id.to_string(), state);
    }

    pub fn domain_state(&self, guest_id: &str) -> Option<DomainState> {
        self.state.lock().domains.get(guest_id).copied()
    }

    /// Make the domain unknown to the hypervisor.
    pub fn set_missing(&self, guest_id: &str) {
        self.state.lock().missing.insert(guest_id.to_string());
    }

    pub fn fail(&self, name: &'static str) {
        self.state.lock().failures.insert(name, None);
    }

    pub fn fail_times(&self, name: &'static str, times: usize) {
        self.state.lock().failures.insert(name, Some(times));
    }

    pub fn delay(&self, name: &'static str, delay: Duration) {
        self.state.lock().delays.insert(name, delay);
    }

    pub fn is_locked(&self, guest_id: &str) -> bool {
        self.state.lock().locks.contains(guest_id)
    }
}

#[async_trait]
impl BotFactory for MockBotFactory {
    async fn open(&self, guest: &Guest) -> GuestvisorResult<Box<dyn Bot>> {
        Ok(Box::new(MockBot {
            guest_id: guest.id.clone(),
            state: Arc::clone(&self.state),
            holds_lock: Mutex::new(false),
        }))
    }

    async fn list_domains(&self) -> GuestvisorResult<Vec<String>> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .domains
            .keys()
            .filter(|id| !state.missing.contains(*id))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

pub struct MockBot {
    guest_id: String,
    state: Arc<Mutex<MockState>>,
    holds_lock: Mutex<bool>,
}

impl MockBot {
    fn push(&self, call: Call) {
        self.state
            .lock()
            .calls
            .entry(self.guest_id.clone())
            .or_default()
            .push(call);
    }

    /// Record `call`, wait out any configured delay, then apply failures.
    async fn hit(&self, call: Call) -> GuestvisorResult<()> {
        let name = call.name();
        self.push(call);

        let delay = self.state.lock().delays.get(name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let failing = match state.failures.get_mut(name) {
            Some(None) => true,
            Some(Some(0)) => false,
            Some(Some(left)) => {
                *left -= 1;
                true
            }
            None => false,
        };
        if failing {
            return Err(GuestvisorError::Hypervisor(format!("{} failed", name)));
        }
        Ok(())
    }

    fn require_domain(&self) -> GuestvisorResult<()> {
        if self.state.lock().missing.contains(&self.guest_id) {
            return Err(GuestvisorError::DomainNotExists(self.guest_id.clone()));
        }
        Ok(())
    }

    fn set_state(&self, st: DomainState) {
        self.state.lock().domains.insert(self.guest_id.clone(), st);
    }
}

#[async_trait]
impl Bot for MockBot {
    fn guest_id(&self) -> &str {
        &self.guest_id
    }

    fn try_lock(&self) -> GuestvisorResult<()> {
        let mut state = self.state.lock();
        if !state.locks.insert(self.guest_id.clone()) {
            return Err(GuestvisorError::Locked(self.guest_id.clone()));
        }
        state
            .calls
            .entry(self.guest_id.clone())
            .or_default()
            .push(Call::Lock);
        *self.holds_lock.lock() = true;
        Ok(())
    }

    fn unlock(&self) {
        let mut holds = self.holds_lock.lock();
        if !*holds {
            return;
        }
        *holds = false;
        let mut state = self.state.lock();
        state.locks.remove(&self.guest_id);
        state
            .calls
            .entry(self.guest_id.clone())
            .or_default()
            .push(Call::Unlock);
    }

    async fn close(&self) -> GuestvisorResult<()> {
        self.push(Call::Close);
        Ok(())
    }

    async fn define(&self, _guest: &Guest) -> GuestvisorResult<()> {
        self.hit(Call::Define).await?;
        self.state.lock().missing.remove(&self.guest_id);
        self.set_state(DomainState::Shutoff);
        Ok(())
    }

    async fn undefine(&self) -> GuestvisorResult<()> {
        self.hit(Call::Undefine).await?;
        let mut state = self.state.lock();
        state.domains.remove(&self.guest_id);
        state.missing.insert(self.guest_id.clone());
        Ok(())
    }

    async fn state(&self) -> GuestvisorResult<DomainState> {
        self.hit(Call::State).await?;
        self.require_domain()?;
        Ok(self
            .state
            .lock()
            .domains
            .get(&self.guest_id)
            .copied()
            .unwrap_or(DomainState::Shutoff))
    }

    async fn boot(&self) -> GuestvisorResult<()> {
        self.hit(Call::Boot).await?;
        self.require_domain()?;
        self.set_state(DomainState::Running);
        Ok(())
    }

    async fn shutdown(&self, force: bool) -> GuestvisorResult<()> {
        self.hit(Call::Shutdown { force }).await?;
        self.require_domain()?;
        self.set_state(DomainState::Shutoff);
        Ok(())
    }

    async fn suspend(&self) -> GuestvisorResult<()> {
        self.hit(Call::Suspend).await?;
        self.set_state(DomainState::Paused);
        Ok(())
    }

    async fn resume(&self) -> GuestvisorResult<()> {
        self.hit(Call::Resume).await?;
        self.set_state(DomainState::Running);
        Ok(())
    }

    async fn resize(&self, cpu: u32, memory: u64) -> GuestvisorResult<()> {
        self.hit(Call::Resize { cpu, memory }).await
    }

    async fn migrate(&self) -> GuestvisorResult<()> {
        self.hit(Call::Migrate).await
    }

    async fn capture(&self, name: &str) -> GuestvisorResult<String> {
        self.hit(Call::Capture(name.to_string())).await?;
        Ok(format!("/images/{}.qcow2", name))
    }

    async fn uuid(&self) -> GuestvisorResult<String> {
        self.hit(Call::Uuid).await?;
        Ok(format!("uuid-{}", self.guest_id))
    }

    async fn ping_agent(&self) -> GuestvisorResult<()> {
        self.hit(Call::PingAgent).await
    }

    async fn reload_agent(&self) -> GuestvisorResult<()> {
        self.hit(Call::ReloadAgent).await
    }

    async fn setup_nics(&self, _guest: &Guest) -> GuestvisorResult<()> {
        self.hit(Call::SetupNics).await
    }

    async fn mount_volume(&self, vol: &Volume) -> GuestvisorResult<()> {
        self.hit(Call::MountVolume(vol.mount_dir.clone())).await
    }

    async fn exec_batch(&self, batch: &Batch) -> GuestvisorResult<()> {
        self.hit(Call::ExecBatch(batch.bins.clone())).await
    }

    async fn bind_extra_network(&self, network: &ExtraNetwork) -> GuestvisorResult<()> {
        self.hit(Call::BindExtraNetwork(network.name.clone())).await
    }

    async fn unbind_extra_network(&self, network: &ExtraNetwork) -> GuestvisorResult<()> {
        self.hit(Call::UnbindExtraNetwork(network.name.clone())).await
    }

    async fn execute_command(&self, cmd: &[String]) -> GuestvisorResult<ExecOutput> {
        self.hit(Call::ExecuteCommand(cmd.to_vec())).await?;
        Ok(ExecOutput {
            output: cmd.join(" ").into_bytes(),
            exit_code: 0,
            pid: 42,
        })
    }

    async fn read_file(&self, path: &str) -> GuestvisorResult<Vec<u8>> {
        self.hit(Call::ReadFile(path.to_string())).await?;
        self.state
            .lock()
            .files
            .get(&(self.guest_id.clone(), path.to_string()))
            .cloned()
            .ok_or_else(|| GuestvisorError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, content: &[u8], overwrite: bool) -> GuestvisorResult<()> {
        self.hit(Call::WriteFile(path.to_string())).await?;
        let key = (self.guest_id.clone(), path.to_string());
        let mut state = self.state.lock();
        if !overwrite && state.files.contains_key(&key) {
            return Err(GuestvisorError::InvalidArgument(format!("{} exists", path)));
        }
        state.files.insert(key, content.to_vec());
        Ok(())
    }

    async fn fs_freeze_all(&self) -> GuestvisorResult<u32> {
        self.hit(Call::FsFreezeAll).await?;
        Ok(2)
    }

    async fn fs_thaw_all(&self) -> GuestvisorResult<u32> {
        self.hit(Call::FsThawAll).await?;
        Ok(2)
    }

    async fn fs_freeze_status(&self) -> GuestvisorResult<String> {
        self.hit(Call::FsFreezeStatus).await?;
        Ok("thawed".to_string())
    }

    async fn attach_gpus(&self, gpus: &GpuParams) -> GuestvisorResult<()> {
        self.hit(Call::AttachGpus(gpus.clone())).await
    }

    async fn detach_gpus(&self, gpus: &GpuParams) -> GuestvisorResult<()> {
        self.hit(Call::DetachGpus(gpus.clone())).await
    }

    async fn attach_volume(&self, vol: &Volume) -> GuestvisorResult<Option<Rollback>> {
        let mount_dir = vol.mount_dir.clone();
        let guest_id = self.guest_id.clone();
        let state = Arc::clone(&self.state);
        let rollback: Rollback = Box::pin(async move {
            state
                .lock()
                .calls
                .entry(guest_id)
                .or_default()
                .push(Call::AttachRollback(mount_dir));
        });

        match self.hit(Call::AttachVolume(vol.mount_dir.clone())).await {
            Ok(()) => Ok(Some(rollback)),
            Err(e) => {
                rollback.await;
                Err(e)
            }
        }
    }

    async fn detach_volume(&self, vol: &Volume) -> GuestvisorResult<()> {
        self.hit(Call::DetachVolume(vol.mount_dir.clone())).await
    }

    async fn amplify_volume(&self, vol: &Volume, delta: u64) -> GuestvisorResult<()> {
        self.hit(Call::AmplifyVolume {
            mount_dir: vol.mount_dir.clone(),
            delta,
        })
        .await
    }

    async fn undefine_volume(&self, vol: &Volume) -> GuestvisorResult<()> {
        self.hit(Call::UndefineVolume(vol.id.clone())).await
    }

    async fn check_volume(&self, vol: &Volume) -> GuestvisorResult<()> {
        self.hit(Call::CheckVolume(vol.id.clone())).await
    }

    async fn repair_volume(&self, vol: &Volume) -> GuestvisorResult<()> {
        self.hit(Call::RepairVolume(vol.id.clone())).await
    }

    async fn create_snapshot(&self, vol: &Volume) -> GuestvisorResult<()> {
        self.hit(Call::CreateSnapshot(vol.id.clone())).await?;
        let mut state = self.state.lock();
        let snaps = state.snapshots.entry(vol.id.clone()).or_default();
        let id = format!("{}-snap{}", vol.id, snaps.len());
        snaps.push(Snapshot { id, created_at: 0 });
        Ok(())
    }

    async fn commit_snapshot(&self, vol: &Volume, snap_id: &str) -> GuestvisorResult<()> {
        self.hit(Call::CommitSnapshot(vol.id.clone(), snap_id.to_string())).await
    }

    async fn commit_snapshot_by_day(&self, vol: &Volume, day: u32) -> GuestvisorResult<()> {
        self.hit(Call::CommitSnapshotByDay(vol.id.clone(), day)).await
    }

    async fn restore_snapshot(&self, vol: &Volume, snap_id: &str) -> GuestvisorResult<()> {
        self.hit(Call::RestoreSnapshot(vol.id.clone(), snap_id.to_string())).await
    }

    async fn list_snapshots(&self, vol: &Volume) -> GuestvisorResult<Vec<Snapshot>> {
        self.hit(Call::ListSnapshots(vol.id.clone())).await?;
        Ok(self
            .state
            .lock()
            .snapshots
            .get(&vol.id)
            .cloned()
            .unwrap_or_default())
    }
}
