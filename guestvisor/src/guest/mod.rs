//! Guest orchestration.
//!
//! [`VirtGuest`] pairs a loaded guest record with the runtime collaborators
//! and implements the multi-step workflows on top of them. Each workflow
//! guards its status transitions, performs hypervisor side effects through a
//! [`BotSession`], and persists the record with version-guarded writes.
//!
//! A `VirtGuest` is loaded fresh for every call and never cached.

mod boot;
mod destroy;
mod exec;
mod lifecycle;
mod network;
mod resize;
mod snapshot;
mod sync;

use std::sync::Arc;

use guestvisor_shared::{GuestvisorError, GuestvisorResult};

use crate::bot::{Bot, BotSession};
use crate::models::{Guest, Status, Volume};
use crate::runtime::SharedRuntime;

pub use destroy::DestroyReceiver;
pub use resize::ResizeRequest;

pub struct VirtGuest {
    meta: Guest,
    rt: SharedRuntime,
}

impl VirtGuest {
    pub fn new(rt: SharedRuntime, meta: Guest) -> Self {
        Self { meta, rt }
    }

    pub fn load(rt: SharedRuntime, id: &str) -> GuestvisorResult<Self> {
        let meta = Guest::load(rt.store.as_ref(), id)?;
        Ok(Self::new(rt, meta))
    }

    /// Re-read the record, dropping any unsaved changes.
    pub fn reload(&mut self) -> GuestvisorResult<()> {
        self.meta = Guest::load(self.rt.store.as_ref(), &self.meta.id)?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn status(&self) -> Option<Status> {
        self.meta.status
    }

    pub fn meta(&self) -> &Guest {
        &self.meta
    }

    pub fn into_meta(self) -> Guest {
        self.meta
    }

    /// Open a bot, taking the host lock unless `skip_lock`.
    async fn open_bot(&self, skip_lock: bool) -> GuestvisorResult<BotSession> {
        BotSession::open(self.rt.bots.as_ref(), &self.meta, skip_lock).await
    }

    /// Open a locked session and hand out a shared handle to its bot.
    async fn locked_bot(&self) -> GuestvisorResult<(BotSession, Arc<dyn Bot>)> {
        let session = self.open_bot(false).await?;
        let bot = Arc::clone(session.bot());
        Ok((session, bot))
    }

    fn save(&mut self) -> GuestvisorResult<()> {
        self.meta.save(self.rt.store.as_ref())
    }

    fn save_all(&mut self) -> GuestvisorResult<()> {
        self.meta.save_all(self.rt.store.as_ref())
    }

    fn forward(&mut self, next: Status, force: bool) -> GuestvisorResult<()> {
        self.meta.forward_status(self.rt.store.as_ref(), next, force)
    }

    fn find_vol(&self, vol_id: &str) -> GuestvisorResult<Volume> {
        self.meta
            .vol_by_id(vol_id)
            .cloned()
            .ok_or_else(|| GuestvisorError::InvalidArgument(format!("volume {} not exists", vol_id)))
    }

    /// Fail unless the stored status is one of `allowed`.
    fn require_status(&self, allowed: &[Status], action: &str) -> GuestvisorResult<()> {
        match self.meta.status {
            Some(status) if allowed.contains(&status) => Ok(()),
            other => Err(GuestvisorError::ForwardStatus {
                from: other.map(|s| s.to_string()).unwrap_or_default(),
                to: action.to_string(),
            }),
        }
    }
}
