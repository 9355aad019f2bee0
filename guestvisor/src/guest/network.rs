//! Extra networks joined or left after creation.
//!
//! The host side is wired through the network driver. A running guest also
//! gets the address bound inside it; a stopped one picks it up on next boot.

use guestvisor_shared::{GuestvisorError, GuestvisorResult, ResultExt};

use super::VirtGuest;
use crate::bot::Bot;
use crate::models::{ExtraNetwork, Status};

const SETTLED: &[Status] = &[Status::Stopped, Status::Running, Status::Paused];

impl VirtGuest {
    /// Join `network` and persist it on the record. Returns the address
    /// assigned to the guest on that network.
    pub async fn connect_extra_network(&mut self, network: ExtraNetwork) -> GuestvisorResult<String> {
        self.require_status(SETTLED, "connect extra network")?;
        if network.name.is_empty() || network.cidr.is_empty() {
            return Err(GuestvisorError::InvalidArgument(
                "extra network requires a name and a cidr".into(),
            ));
        }
        if self.meta.extra_networks.iter().any(|n| n.name == network.name) {
            return Err(GuestvisorError::InvalidArgument(format!(
                "extra network {} already connected",
                network.name
            )));
        }

        let (session, bot) = self.locked_bot().await?;
        let result: GuestvisorResult<()> = async {
            self.rt
                .network
                .connect_extra(&self.meta, &network)
                .await
                .with_context(|| format!("connect extra network {}", network.name))?;

            let joined = self.bind_and_save(bot.as_ref(), &network).await;
            if joined.is_err() {
                if let Err(e) = self.rt.network.disconnect_extra(&self.meta, &network).await {
                    tracing::warn!(guest_id = %self.meta.id, network = %network.name, error = %e,
                        "Failed to undo extra network connect");
                }
            }
            joined
        }
        .await;
        session.finish().await;

        result?;
        tracing::info!(guest_id = %self.meta.id, network = %network.name, cidr = %network.cidr,
            "Connected extra network");
        Ok(network.cidr)
    }

    async fn bind_and_save(&mut self, bot: &dyn Bot, network: &ExtraNetwork) -> GuestvisorResult<()> {
        if self.meta.status == Some(Status::Running) {
            bot.bind_extra_network(network)
                .await
                .with_context(|| format!("bind extra network {}", network.name))?;
        }
        self.meta.extra_networks.push(network.clone());
        if let Err(e) = self.save() {
            self.meta.extra_networks.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Leave the extra network called `name` and drop it from the record.
    pub async fn disconnect_extra_network(&mut self, name: &str) -> GuestvisorResult<()> {
        self.require_status(SETTLED, "disconnect extra network")?;
        let idx = self
            .meta
            .extra_networks
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| {
                GuestvisorError::NotFound(format!("extra network {} of guest {}", name, self.meta.id))
            })?;
        let network = self.meta.extra_networks[idx].clone();

        let (session, bot) = self.locked_bot().await?;
        let result: GuestvisorResult<()> = async {
            if self.meta.status == Some(Status::Running) {
                if let Err(e) = bot.unbind_extra_network(&network).await {
                    tracing::warn!(guest_id = %self.meta.id, network = %network.name, error = %e,
                        "Failed to unbind extra network inside guest");
                }
            }
            self.rt
                .network
                .disconnect_extra(&self.meta, &network)
                .await
                .with_context(|| format!("disconnect extra network {}", network.name))?;

            let removed = self.meta.extra_networks.remove(idx);
            if let Err(e) = self.save() {
                self.meta.extra_networks.insert(idx, removed);
                return Err(e);
            }
            Ok(())
        }
        .await;
        session.finish().await;

        if result.is_ok() {
            tracing::info!(guest_id = %self.meta.id, network = %network.name, "Disconnected extra network");
        }
        result
    }
}
