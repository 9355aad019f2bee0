//! Reconciliation between stored status and the hypervisor.

use std::sync::Arc;

use guestvisor_shared::GuestvisorResult;

use super::VirtGuest;
use crate::context::CallContext;
use crate::models::Status;

impl VirtGuest {
    /// Drive a guest stuck in an intermediate status to where it was headed.
    pub async fn sync_state(&mut self, ctx: &CallContext) -> GuestvisorResult<()> {
        match self.meta.status {
            Some(Status::Destroying) => self.process_destroy(false).await,
            Some(Status::Stopping | Status::Stopped) => self.stop_domain(true).await,
            Some(Status::Running | Status::Starting) => self.start_domain(ctx).await,
            Some(Status::Creating) => self.define().await,
            _ => Ok(()),
        }
    }

    /// Correct `running`/`stopped` when the domain says otherwise. A guest
    /// locked by another operation is left alone.
    pub async fn update_state_if_necessary(&mut self) -> GuestvisorResult<()> {
        let session = match self.open_bot(false).await {
            Ok(session) => session,
            Err(e) if e.is_locked() => return Ok(()),
            Err(e) => return Err(e),
        };
        let bot = Arc::clone(session.bot());

        let result = async {
            let state = match bot.state().await {
                Ok(state) => state,
                Err(e) if e.is_domain_not_exists() => return Ok(()),
                Err(e) => return Err(e),
            };
            let next = match self.meta.status {
                Some(Status::Running) if state.is_stopped() => Some(Status::Stopped),
                Some(Status::Stopped) if state.is_running() => Some(Status::Running),
                _ => None,
            };
            if let Some(next) = next {
                tracing::info!(guest_id = %self.meta.id, domain = %state, status = %next, "Correcting guest status");
                if let Err(e) = self.forward(next, true) {
                    tracing::warn!(guest_id = %self.meta.id, error = %e, "Failed to correct guest status");
                }
            }
            Ok(())
        }
        .await;

        session.finish().await;
        result
    }
}
