use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use guestvisor_shared::{GuestvisorError, GuestvisorResult};

use super::NetworkDriver;
use crate::models::{ExtraNetwork, Guest};

/// Records network operations as `"<op>:<guest_id>"`.
#[derive(Clone, Default)]
pub struct MockNetwork {
    ops: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<&'static str>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    fn record(&self, op: &'static str, guest: &Guest) -> GuestvisorResult<()> {
        self.ops.lock().push(format!("{}:{}", op, guest.id));
        if self.failing.lock().contains(op) {
            return Err(GuestvisorError::Internal(format!("{} failed", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkDriver for MockNetwork {
    async fn join_ethernet(&self, guest: &Guest) -> GuestvisorResult<()> {
        self.record("join_ethernet", guest)
    }

    async fn limit_bandwidth(&self, guest: &Guest) -> GuestvisorResult<()> {
        self.record("limit_bandwidth", guest)
    }

    async fn delete_network(&self, guest: &Guest) -> GuestvisorResult<()> {
        self.record("delete_network", guest)
    }

    async fn connect_extra(&self, guest: &Guest, _network: &ExtraNetwork) -> GuestvisorResult<()> {
        self.record("connect_extra", guest)
    }

    async fn disconnect_extra(&self, guest: &Guest, _network: &ExtraNetwork) -> GuestvisorResult<()> {
        self.record("disconnect_extra", guest)
    }
}
