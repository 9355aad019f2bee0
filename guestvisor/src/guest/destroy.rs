//! Guest teardown.
//!
//! `destroy` returns once the `destroying` status is durable. Undefining the
//! domain and deleting metadata run in a spawned task whose outcome arrives on
//! the returned channel.

use tokio::sync::oneshot;

use guestvisor_shared::{GuestvisorResult, ResultExt};

use super::VirtGuest;
use crate::models::Status;

/// Delivers the outcome of the background teardown.
pub type DestroyReceiver = oneshot::Receiver<GuestvisorResult<()>>;

impl VirtGuest {
    /// Stop the guest, mark it destroying, and tear it down in the background.
    ///
    /// A forced destroy hard-stops the domain instead of shutting it down
    /// gracefully, and tears down without taking the host lock.
    pub async fn destroy(mut self, force: bool) -> GuestvisorResult<DestroyReceiver> {
        let needs_stop = !matches!(
            self.meta.status,
            Some(Status::Stopped | Status::Destroying | Status::Destroyed)
        );
        if needs_stop {
            match self.stop(force).await {
                Ok(()) => {}
                Err(e) if e.is_domain_not_exists() => {
                    tracing::info!(guest_id = %self.meta.id, "Domain already absent");
                    self.forward(Status::Stopped, true)?;
                }
                Err(e) => return Err(e.context("stop before destroy")),
            }
        }

        self.meta.forward_destroying(self.rt.store.as_ref(), force)?;
        tracing::info!(guest_id = %self.meta.id, force, "Guest marked destroying");

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = self.process_destroy(force).await;
            if let Err(e) = &result {
                tracing::error!(guest_id = %self.meta.id, error = %e, "Failed to destroy guest");
            }
            let _ = tx.send(result);
        });
        Ok(rx)
    }

    /// Undefine the domain and release everything the guest owns. Network
    /// and volume cleanup is best effort; metadata goes last.
    pub(super) async fn process_destroy(&mut self, force: bool) -> GuestvisorResult<()> {
        tracing::info!(guest_id = %self.meta.id, "Tearing down guest");
        let session = self.open_bot(force).await?;
        let bot = std::sync::Arc::clone(session.bot());

        let result = async {
            match bot.undefine().await {
                Ok(()) => {}
                Err(e) if e.is_domain_not_exists() => {
                    tracing::debug!(guest_id = %self.meta.id, "Domain already undefined");
                }
                Err(e) => return Err(e.context("undefine domain")),
            }

            let iso = self.rt.config.cloud_init_iso(&self.meta.id);
            if let Err(e) = tokio::fs::remove_file(&iso).await {
                tracing::trace!(path = %iso.display(), error = %e, "No cloud-init image removed");
            }

            for network in &self.meta.extra_networks {
                if let Err(e) = self.rt.network.disconnect_extra(&self.meta, network).await {
                    tracing::warn!(guest_id = %self.meta.id, network = %network.name, error = %e, "Failed to disconnect extra network");
                }
            }
            if let Err(e) = self.rt.network.delete_network(&self.meta).await {
                tracing::warn!(guest_id = %self.meta.id, error = %e, "Failed to delete network");
            }
            for vol in &self.meta.vols {
                if let Err(e) = bot.undefine_volume(vol).await {
                    tracing::warn!(guest_id = %self.meta.id, volume_id = %vol.id, error = %e, "Failed to undefine volume");
                }
            }

            self.meta
                .delete(self.rt.store.as_ref(), force)
                .context("delete metadata")
        }
        .await;

        session.finish().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::mock::Call;
    use crate::guest::testing::Harness;

    #[tokio::test]
    async fn test_graceful_destroy_of_running_guest() {
        let h = Harness::new();
        let vg = h.virt_guest(Status::Running);
        let id = vg.id().to_string();

        let done = vg.destroy(false).await.unwrap();
        done.await.unwrap().unwrap();

        let calls = h.bots.effects(&id);
        assert_eq!(calls[0], Call::Shutdown { force: false });
        assert!(calls.contains(&Call::Undefine));
        assert_eq!(h.bots.count(&id, "undefine_volume"), 2);
        assert!(h.store.is_empty());
        assert_eq!(h.network.ops(), vec![format!("delete_network:{}", id)]);
    }

    #[tokio::test]
    async fn test_forced_destroy_skips_graceful_stop() {
        let h = Harness::new();
        let vg = h.virt_guest(Status::Running);
        let id = vg.id().to_string();

        let done = vg.destroy(true).await.unwrap();
        done.await.unwrap().unwrap();

        let calls = h.bots.effects(&id);
        assert!(calls.contains(&Call::Shutdown { force: true }));
        assert!(!calls.contains(&Call::Shutdown { force: false }));
        // Teardown ran without the host lock.
        assert_eq!(h.bots.count(&id, "lock"), 1);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_tolerates_missing_domain() {
        let h = Harness::new();
        let vg = h.virt_guest(Status::Running);
        let id = vg.id().to_string();
        h.bots.set_missing(&id);

        let done = vg.destroy(false).await.unwrap();
        done.await.unwrap().unwrap();
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_guest_is_not_stopped_again() {
        let h = Harness::new();
        let vg = h.virt_guest(Status::Stopped);
        let id = vg.id().to_string();

        let done = vg.destroy(false).await.unwrap();
        done.await.unwrap().unwrap();
        assert_eq!(h.bots.count(&id, "shutdown"), 0);
    }

    #[tokio::test]
    async fn test_teardown_failure_is_reported_on_channel() {
        let h = Harness::new();
        let vg = h.virt_guest(Status::Stopped);
        let id = vg.id().to_string();
        h.bots.fail("undefine");

        let done = vg.destroy(false).await.unwrap();
        let err = done.await.unwrap().unwrap_err();
        assert!(err.to_string().starts_with("undefine domain"));
        assert_eq!(h.stored(&id).status, Some(Status::Destroying));
    }

    #[tokio::test]
    async fn test_destroy_rejected_from_paused_without_force() {
        let h = Harness::new();
        let vg = h.virt_guest(Status::Paused);
        let id = vg.id().to_string();

        let err = vg.destroy(false).await.unwrap_err();
        assert!(err.is_forward_status());
        assert_eq!(h.stored(&id).status, Some(Status::Paused));
        assert_eq!(h.bots.count(&id, "shutdown"), 0);
    }
}
