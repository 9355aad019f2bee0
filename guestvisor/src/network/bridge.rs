//! Guests attached to a Linux bridge through libvirt.
//!
//! The bridge itself is set up outside the daemon. Joining only has to make
//! the guest interface reachable; bandwidth goes through `virsh domiftune`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use guestvisor_shared::{GuestvisorError, GuestvisorResult};

use super::NetworkDriver;
use crate::config::VirtConfig;
use crate::models::{ExtraNetwork, Guest};

pub struct BridgeNetwork {
    config: Arc<VirtConfig>,
}

impl BridgeNetwork {
    pub fn new(config: Arc<VirtConfig>) -> Self {
        Self { config }
    }

    async fn virsh(&self, args: &[&str]) -> GuestvisorResult<String> {
        let output = Command::new("virsh")
            .arg("-c")
            .arg(&self.config.libvirt_uri)
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            return Err(GuestvisorError::Hypervisor(format!(
                "virsh {}: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Host-side interface names of the guest, in definition order.
    async fn interfaces(&self, guest: &Guest) -> GuestvisorResult<Vec<String>> {
        let out = self.virsh(&["domiflist", &guest.id]).await?;
        Ok(parse_domiflist(&out))
    }
}

#[async_trait]
impl NetworkDriver for BridgeNetwork {
    async fn join_ethernet(&self, guest: &Guest) -> GuestvisorResult<()> {
        let ifaces = self.interfaces(guest).await?;
        if ifaces.is_empty() {
            return Err(GuestvisorError::InvalidState(format!(
                "{} has no network interface",
                guest.id
            )));
        }
        tracing::debug!(guest_id = %guest.id, bridge = %self.config.bridge, ?ifaces, "Guest joined bridge");
        Ok(())
    }

    async fn limit_bandwidth(&self, guest: &Guest) -> GuestvisorResult<()> {
        if self.config.bandwidth_kbps == 0 {
            return Ok(());
        }
        let rate = self.config.bandwidth_kbps.to_string();
        for iface in self.interfaces(guest).await? {
            self.virsh(&[
                "domiftune", &guest.id, &iface, "--inbound", &rate, "--outbound", &rate, "--live",
            ])
            .await?;
        }
        Ok(())
    }

    async fn delete_network(&self, guest: &Guest) -> GuestvisorResult<()> {
        tracing::debug!(guest_id = %guest.id, "Released bridge attachment");
        Ok(())
    }

    async fn connect_extra(&self, guest: &Guest, network: &ExtraNetwork) -> GuestvisorResult<()> {
        self.virsh(&[
            "attach-interface", &guest.id, "bridge", &network.name, "--model", "virtio", "--persistent",
        ])
        .await
        .map(|_| ())
    }

    async fn disconnect_extra(&self, guest: &Guest, network: &ExtraNetwork) -> GuestvisorResult<()> {
        let out = self.virsh(&["domiflist", &guest.id]).await?;
        let Some(mac) = mac_on_source(&out, &network.name) else {
            return Ok(());
        };
        self.virsh(&["detach-interface", &guest.id, "bridge", "--mac", &mac, "--persistent"])
            .await
            .map(|_| ())
    }
}

/// Rows of `virsh domiflist` after the two header lines.
fn rows(out: &str) -> impl Iterator<Item = Vec<&str>> {
    out.lines()
        .skip(2)
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .filter(|cols| cols.len() >= 5)
}

fn parse_domiflist(out: &str) -> Vec<String> {
    rows(out)
        .map(|cols| cols[0])
        .filter(|name| *name != "-")
        .map(str::to_string)
        .collect()
}

fn mac_on_source(out: &str, source: &str) -> Option<String> {
    rows(out)
        .find(|cols| cols[2] == source)
        .map(|cols| cols[4].to_string())
}
