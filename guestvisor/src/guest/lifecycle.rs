use std::time::Duration;

use guestvisor_shared::{GuestvisorError, GuestvisorResult, ResultExt};

use super::VirtGuest;
use crate::context::CallContext;
use crate::models::Status;

const WAIT_INTERVAL: Duration = Duration::from_secs(1);
const WAIT_RETRIES: u32 = 30;

impl VirtGuest {
    /// Define the domain of a freshly created record.
    pub async fn create(&mut self) -> GuestvisorResult<()> {
        self.meta.forward_creating(self.rt.store.as_ref(), false)?;
        self.define().await
    }

    pub(super) async fn define(&mut self) -> GuestvisorResult<()> {
        let (session, bot) = self.locked_bot().await?;
        let result = async {
            bot.define(&self.meta).await.context("define domain")?;
            for network in &self.meta.extra_networks {
                self.rt
                    .network
                    .connect_extra(&self.meta, network)
                    .await
                    .with_context(|| format!("connect extra network {}", network.name))?;
            }
            Ok(())
        }
        .await;
        session.finish().await;
        result
    }

    pub async fn start(&mut self, ctx: &CallContext) -> GuestvisorResult<()> {
        self.meta.forward_starting(self.rt.store.as_ref(), false)?;
        self.start_domain(ctx).await
    }

    /// Boot unless already running, then wire up networking and forward to
    /// `running`. Status is not guarded on entry.
    pub(super) async fn start_domain(&mut self, ctx: &CallContext) -> GuestvisorResult<()> {
        let (session, bot) = self.locked_bot().await?;
        let result = async {
            if bot.state().await.context("get domain state")?.is_running() {
                return self.meta.forward_running(self.rt.store.as_ref(), false);
            }
            self.boot_with(&bot, ctx).await?;
            self.rt
                .network
                .join_ethernet(&self.meta)
                .await
                .context("join ethernet")?;
            self.rt
                .network
                .limit_bandwidth(&self.meta)
                .await
                .context("limit bandwidth")?;
            self.meta.forward_running(self.rt.store.as_ref(), false)
        }
        .await;
        session.finish().await;
        result
    }

    /// Shut the domain down. A forced stop ignores an illegal `stopping`
    /// transition and forces `stopped`.
    pub async fn stop(&mut self, force: bool) -> GuestvisorResult<()> {
        if let Err(e) = self.meta.forward_stopping(self.rt.store.as_ref(), false) {
            if !force {
                return Err(e);
            }
            tracing::debug!(guest_id = %self.meta.id, error = %e, "Ignoring stopping transition");
        }
        self.stop_domain(force).await
    }

    pub(super) async fn stop_domain(&mut self, force: bool) -> GuestvisorResult<()> {
        let (session, bot) = self.locked_bot().await?;
        let result = async {
            bot.shutdown(force).await.context("shutdown")?;
            self.meta.forward_stopped(self.rt.store.as_ref(), force)
        }
        .await;
        session.finish().await;
        result
    }

    pub async fn suspend(&mut self) -> GuestvisorResult<()> {
        self.meta.forward_pausing(self.rt.store.as_ref(), false)?;
        let (session, bot) = self.locked_bot().await?;
        let result = async {
            bot.suspend().await.context("suspend")?;
            self.meta.forward_paused(self.rt.store.as_ref(), false)
        }
        .await;
        session.finish().await;
        result
    }

    pub async fn resume(&mut self) -> GuestvisorResult<()> {
        self.meta.forward_resuming(self.rt.store.as_ref(), false)?;
        let (session, bot) = self.locked_bot().await?;
        let result = async {
            bot.resume().await.context("resume")?;
            self.meta.forward_running(self.rt.store.as_ref(), false)
        }
        .await;
        session.finish().await;
        result
    }

    /// Export the system disk as image `name`; the guest ends up stopped.
    pub async fn capture(&mut self, name: &str) -> GuestvisorResult<String> {
        self.meta.forward_capturing(self.rt.store.as_ref(), false)?;
        let (session, bot) = self.locked_bot().await?;
        let result: GuestvisorResult<String> = async {
            let location = bot.capture(name).await.context("capture image")?;
            self.meta.forward_captured(self.rt.store.as_ref(), false)?;
            Ok(location)
        }
        .await;
        session.finish().await;

        let location = result?;
        self.meta.forward_stopped(self.rt.store.as_ref(), false)?;
        tracing::info!(guest_id = %self.meta.id, image = %name, location = %location, "Captured image");
        Ok(location)
    }

    pub async fn migrate(&mut self) -> GuestvisorResult<()> {
        self.meta.forward_migrating(self.rt.store.as_ref(), false)?;
        let (session, bot) = self.locked_bot().await?;
        let result = bot.migrate().await.context("migrate");
        session.finish().await;
        result
    }

    /// Poll until the stored status equals `to`, reconciling it against the
    /// domain between polls. Non-blocking waits give up after 30 polls.
    pub async fn wait(&mut self, to: Status, block: bool) -> GuestvisorResult<()> {
        let mut polls = 0u32;
        loop {
            if self.meta.status == Some(to) {
                return Ok(());
            }
            if !block && polls >= WAIT_RETRIES {
                return Err(GuestvisorError::Timeout(WAIT_INTERVAL * WAIT_RETRIES)
                    .context(format!("wait for {} to be {}", self.meta.id, to)));
            }
            polls += 1;
            tokio::time::sleep(WAIT_INTERVAL).await;

            self.update_state_if_necessary().await?;
            self.reload()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::DomainState;
    use crate::bot::mock::Call;
    use crate::guest::testing::Harness;

    #[tokio::test]
    async fn test_start_from_stopped() {
        let h = Harness::new();
        let mut vg = h.virt_guest(Status::Stopped);

        vg.start(&CallContext::background()).await.unwrap();

        assert_eq!(h.stored(vg.id()).status, Some(Status::Running));
        assert_eq!(
            h.network.ops(),
            vec![
                format!("join_ethernet:{}", vg.id()),
                format!("limit_bandwidth:{}", vg.id())
            ]
        );
        assert!(!h.bots.is_locked(vg.id()));
    }

    #[tokio::test]
    async fn test_start_short_circuits_running_domain() {
        let h = Harness::new();
        let mut vg = h.virt_guest(Status::Stopped);
        h.bots.set_domain_state(vg.id(), DomainState::Running);

        vg.start(&CallContext::background()).await.unwrap();

        assert_eq!(h.bots.count(vg.id(), "boot"), 0);
        assert!(h.network.ops().is_empty());
        assert_eq!(vg.status(), Some(Status::Running));
    }

    #[tokio::test]
    async fn test_start_rejected_while_running() {
        let h = Harness::new();
        let mut vg = h.virt_guest(Status::Running);
        let err = vg.start(&CallContext::background()).await.unwrap_err();
        assert!(err.is_forward_status());
        assert!(h.bots.calls(vg.id()).is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_when_locked() {
        let h = Harness::new();
        let vg = h.virt_guest(Status::Stopped);
        let holder = vg.open_bot(false).await.unwrap();

        let mut vg = VirtGuest::load(h.rt.clone(), vg.id()).unwrap();
        let err = vg.start(&CallContext::background()).await.unwrap_err();
        assert!(err.is_locked());
        assert_eq!(h.bots.count(vg.id(), "boot"), 0);
        holder.finish().await;
    }

    #[tokio::test]
    async fn test_stop_graceful_and_forced() {
        let h = Harness::new();
        let mut vg = h.virt_guest(Status::Running);
        vg.stop(false).await.unwrap();
        assert_eq!(h.stored(vg.id()).status, Some(Status::Stopped));
        assert!(h.bots.effects(vg.id()).contains(&Call::Shutdown { force: false }));

        // stopping is illegal from stopped; only a forced stop proceeds.
        assert!(vg.stop(false).await.unwrap_err().is_forward_status());
        vg.stop(true).await.unwrap();
        assert!(h.bots.effects(vg.id()).contains(&Call::Shutdown { force: true }));
    }

    #[tokio::test]
    async fn test_suspend_resume_round_trip() {
        let h = Harness::new();
        let mut vg = h.virt_guest(Status::Running);

        vg.suspend().await.unwrap();
        assert_eq!(h.stored(vg.id()).status, Some(Status::Paused));
        assert_eq!(h.bots.domain_state(vg.id()), Some(DomainState::Paused));

        vg.resume().await.unwrap();
        assert_eq!(h.stored(vg.id()).status, Some(Status::Running));
    }

    #[tokio::test]
    async fn test_capture_returns_to_stopped() {
        let h = Harness::new();
        let mut vg = h.virt_guest(Status::Stopped);

        let location = vg.capture("golden").await.unwrap();
        assert_eq!(location, "/images/golden.qcow2");
        assert_eq!(h.stored(vg.id()).status, Some(Status::Stopped));
    }

    #[tokio::test]
    async fn test_failed_capture_stays_capturing() {
        let h = Harness::new();
        let mut vg = h.virt_guest(Status::Stopped);
        h.bots.fail("capture");

        assert!(vg.capture("golden").await.is_err());
        assert_eq!(h.stored(vg.id()).status, Some(Status::Capturing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sees_guest_stop_on_its_own() {
        let h = Harness::new();
        let mut vg = h.virt_guest(Status::Running);
        h.bots.set_domain_state(vg.id(), DomainState::Shutoff);

        vg.wait(Status::Stopped, false).await.unwrap();
        assert_eq!(vg.status(), Some(Status::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_blocking_wait_gives_up() {
        let h = Harness::new();
        let mut vg = h.virt_guest(Status::Running);

        let err = vg.wait(Status::Stopped, false).await.unwrap_err();
        assert!(matches!(err.root(), GuestvisorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_create_defines_domain() {
        let h = Harness::new();
        let mut vg = h.virt_guest(Status::Pending);

        vg.create().await.unwrap();
        assert_eq!(h.stored(vg.id()).status, Some(Status::Creating));
        assert_eq!(h.bots.effects(vg.id()), vec![Call::Define]);
    }
}
