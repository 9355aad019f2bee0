//! Host-side networking for guests.

mod bridge;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;

use guestvisor_shared::GuestvisorResult;

use crate::models::{ExtraNetwork, Guest};

pub use bridge::BridgeNetwork;

/// Plugs guests into host networks.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Route the guest's primary addresses on the host.
    async fn join_ethernet(&self, guest: &Guest) -> GuestvisorResult<()>;

    async fn limit_bandwidth(&self, guest: &Guest) -> GuestvisorResult<()>;

    /// Tear down everything `join_ethernet` set up.
    async fn delete_network(&self, guest: &Guest) -> GuestvisorResult<()>;

    async fn connect_extra(&self, guest: &Guest, network: &ExtraNetwork) -> GuestvisorResult<()>;

    async fn disconnect_extra(&self, guest: &Guest, network: &ExtraNetwork) -> GuestvisorResult<()>;
}
