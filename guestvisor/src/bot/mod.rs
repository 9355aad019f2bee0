//! Hypervisor collaborator.
//!
//! A [`Bot`] drives one guest's domain. Orchestration code never talks to the
//! hypervisor any other way: it asks a [`BotFactory`] for a fresh bot per
//! operation and wraps it in a [`BotSession`], which takes the per-guest host
//! lock and guarantees unlock and close on every exit path.

pub mod flock;
#[cfg(test)]
pub mod mock;
mod virsh;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use guestvisor_shared::GuestvisorResult;

use crate::config::Batch;
use crate::models::{ExtraNetwork, GpuParams, Guest, Volume};

pub use virsh::{VirshBot, VirshBotFactory};

/// Undo step returned by a side effect that can be reverted.
pub type Rollback = BoxFuture<'static, ()>;

/// Domain state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    pub fn is_running(self) -> bool {
        self == DomainState::Running
    }

    pub fn is_stopped(self) -> bool {
        self == DomainState::Shutoff
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DomainState::NoState => "no state",
            DomainState::Running => "running",
            DomainState::Blocked => "idle",
            DomainState::Paused => "paused",
            DomainState::ShuttingDown => "in shutdown",
            DomainState::Shutoff => "shut off",
            DomainState::Crashed => "crashed",
            DomainState::PmSuspended => "pmsuspended",
        };
        f.write_str(s)
    }
}

/// Result of a command run through the guest agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: Vec<u8>,
    pub exit_code: i32,
    pub pid: i32,
}

/// A volume snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub created_at: i64,
}

/// Hypervisor operations for a single guest.
#[async_trait]
pub trait Bot: Send + Sync {
    fn guest_id(&self) -> &str;

    /// Take the per-guest host lock without blocking; fails with `Locked`.
    fn try_lock(&self) -> GuestvisorResult<()>;

    fn unlock(&self);

    /// Release the hypervisor connection and agent channel.
    async fn close(&self) -> GuestvisorResult<()>;

    // Domain lifecycle.
    async fn define(&self, guest: &Guest) -> GuestvisorResult<()>;
    async fn undefine(&self) -> GuestvisorResult<()>;
    async fn state(&self) -> GuestvisorResult<DomainState>;
    /// Start the domain. Post-boot guest setup is driven by the caller.
    async fn boot(&self) -> GuestvisorResult<()>;
    async fn shutdown(&self, force: bool) -> GuestvisorResult<()>;
    async fn suspend(&self) -> GuestvisorResult<()>;
    async fn resume(&self) -> GuestvisorResult<()>;
    async fn resize(&self, cpu: u32, memory: u64) -> GuestvisorResult<()>;
    async fn migrate(&self) -> GuestvisorResult<()>;
    /// Export the system disk as an image, returning its location.
    async fn capture(&self, name: &str) -> GuestvisorResult<String>;
    async fn uuid(&self) -> GuestvisorResult<String>;

    // Guest agent.
    async fn ping_agent(&self) -> GuestvisorResult<()>;
    async fn reload_agent(&self) -> GuestvisorResult<()>;
    async fn setup_nics(&self, guest: &Guest) -> GuestvisorResult<()>;
    async fn mount_volume(&self, vol: &Volume) -> GuestvisorResult<()>;
    async fn exec_batch(&self, batch: &Batch) -> GuestvisorResult<()>;
    async fn bind_extra_network(&self, network: &ExtraNetwork) -> GuestvisorResult<()>;
    async fn unbind_extra_network(&self, network: &ExtraNetwork) -> GuestvisorResult<()>;
    async fn execute_command(&self, cmd: &[String]) -> GuestvisorResult<ExecOutput>;
    async fn read_file(&self, path: &str) -> GuestvisorResult<Vec<u8>>;
    async fn write_file(&self, path: &str, content: &[u8], overwrite: bool) -> GuestvisorResult<()>;
    async fn fs_freeze_all(&self) -> GuestvisorResult<u32>;
    async fn fs_thaw_all(&self) -> GuestvisorResult<u32>;
    async fn fs_freeze_status(&self) -> GuestvisorResult<String>;

    // Devices.
    async fn attach_gpus(&self, gpus: &GpuParams) -> GuestvisorResult<()>;
    async fn detach_gpus(&self, gpus: &GpuParams) -> GuestvisorResult<()>;
    /// Attach a volume; the returned rollback, if any, undoes the attach.
    ///
    /// On error the implementor has already undone its own partial work,
    /// such as a freshly created backing file. Callers only run the rollback
    /// when a later step fails after a successful attach.
    async fn attach_volume(&self, vol: &Volume) -> GuestvisorResult<Option<Rollback>>;
    async fn detach_volume(&self, vol: &Volume) -> GuestvisorResult<()>;
    /// Grow a volume by `delta` bytes.
    async fn amplify_volume(&self, vol: &Volume, delta: u64) -> GuestvisorResult<()>;
    /// Release a volume's backing storage.
    async fn undefine_volume(&self, vol: &Volume) -> GuestvisorResult<()>;

    // Volume maintenance and snapshots.
    async fn check_volume(&self, vol: &Volume) -> GuestvisorResult<()>;
    async fn repair_volume(&self, vol: &Volume) -> GuestvisorResult<()>;
    async fn create_snapshot(&self, vol: &Volume) -> GuestvisorResult<()>;
    async fn commit_snapshot(&self, vol: &Volume, snap_id: &str) -> GuestvisorResult<()>;
    async fn commit_snapshot_by_day(&self, vol: &Volume, day: u32) -> GuestvisorResult<()>;
    async fn restore_snapshot(&self, vol: &Volume, snap_id: &str) -> GuestvisorResult<()>;
    async fn list_snapshots(&self, vol: &Volume) -> GuestvisorResult<Vec<Snapshot>>;
}

/// Produces a fresh bot, bound to a new hypervisor connection, per operation.
#[async_trait]
pub trait BotFactory: Send + Sync {
    async fn open(&self, guest: &Guest) -> GuestvisorResult<Box<dyn Bot>>;

    /// Names of every domain defined on this host.
    async fn list_domains(&self) -> GuestvisorResult<Vec<String>>;
}

/// An open bot, optionally holding the guest's host lock.
///
/// Call [`BotSession::finish`] to release it; dropping an unfinished session
/// unlocks immediately and closes in the background.
pub struct BotSession {
    bot: Arc<dyn Bot>,
    locked: bool,
    closed: bool,
}

impl BotSession {
    /// Open a bot and, unless `skip_lock`, take the guest's host lock.
    pub async fn open(
        factory: &dyn BotFactory,
        guest: &Guest,
        skip_lock: bool,
    ) -> GuestvisorResult<Self> {
        let bot: Arc<dyn Bot> = Arc::from(factory.open(guest).await?);
        let mut session = Self {
            bot,
            locked: false,
            closed: false,
        };

        if !skip_lock {
            if let Err(e) = session.bot.try_lock() {
                session.finish().await;
                return Err(e);
            }
            session.locked = true;
        }

        Ok(session)
    }

    pub fn bot(&self) -> &Arc<dyn Bot> {
        &self.bot
    }

    /// Unlock, then close. Close failures are logged only.
    pub async fn finish(mut self) {
        if self.locked {
            self.bot.unlock();
            self.locked = false;
        }
        if let Err(e) = self.bot.close().await {
            tracing::warn!(guest_id = %self.bot.guest_id(), error = %e, "Failed to close bot");
        }
        self.closed = true;
    }
}

impl Drop for BotSession {
    fn drop(&mut self) {
        if self.locked {
            self.bot.unlock();
        }
        if self.closed {
            return;
        }
        let bot = Arc::clone(&self.bot);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = bot.close().await {
                    tracing::warn!(guest_id = %bot.guest_id(), error = %e, "Failed to close bot");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{Call, MockBotFactory};
    use super::*;
    use crate::models::Guest;

    #[tokio::test]
    async fn test_session_unlocks_and_closes() {
        let factory = MockBotFactory::new();
        let guest = Guest::new("host1", "ubuntu", 1, 1 << 30);

        let session = BotSession::open(&factory, &guest, false).await.unwrap();
        session.finish().await;

        let calls = factory.calls(&guest.id);
        assert_eq!(calls, vec![Call::Lock, Call::Unlock, Call::Close]);
    }

    #[tokio::test]
    async fn test_session_skip_lock() {
        let factory = MockBotFactory::new();
        let guest = Guest::new("host1", "ubuntu", 1, 1 << 30);

        let session = BotSession::open(&factory, &guest, true).await.unwrap();
        session.finish().await;

        assert_eq!(factory.calls(&guest.id), vec![Call::Close]);
    }

    #[tokio::test]
    async fn test_held_lock_fails_open() {
        let factory = MockBotFactory::new();
        let guest = Guest::new("host1", "ubuntu", 1, 1 << 30);

        let first = BotSession::open(&factory, &guest, false).await.unwrap();
        let err = BotSession::open(&factory, &guest, false).await.err().unwrap();
        assert!(err.is_locked());

        drop(first);
        let again = BotSession::open(&factory, &guest, false).await.unwrap();
        again.finish().await;
    }
}
