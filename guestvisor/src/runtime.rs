//! Collaborators shared by every guest operation.

use std::fmt;
use std::sync::Arc;

use guestvisor_shared::GuestvisorResult;

use crate::bot::{BotFactory, VirshBotFactory};
use crate::config::VirtConfig;
use crate::network::{BridgeNetwork, NetworkDriver};
use crate::store::{SqliteStore, Store};

pub type SharedRuntime = Arc<GuestRuntime>;

/// Immutable after construction; cloned around as [`SharedRuntime`].
pub struct GuestRuntime {
    pub config: Arc<VirtConfig>,
    pub store: Arc<dyn Store>,
    pub bots: Arc<dyn BotFactory>,
    pub network: Arc<dyn NetworkDriver>,
}

impl GuestRuntime {
    pub fn new(
        config: Arc<VirtConfig>,
        store: Arc<dyn Store>,
        bots: Arc<dyn BotFactory>,
        network: Arc<dyn NetworkDriver>,
    ) -> SharedRuntime {
        Arc::new(Self {
            config,
            store,
            bots,
            network,
        })
    }

    /// Production wiring: SQLite metadata, `virsh` bots, bridge networking.
    pub fn open(config: VirtConfig) -> GuestvisorResult<SharedRuntime> {
        let config = Arc::new(config);
        let store = SqliteStore::open(&config.database_path)?;
        Ok(Self::new(
            Arc::clone(&config),
            Arc::new(store),
            Arc::new(VirshBotFactory::new(Arc::clone(&config))),
            Arc::new(BridgeNetwork::new(config)),
        ))
    }
}

impl fmt::Debug for GuestRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestRuntime")
            .field("host_name", &self.config.host_name)
            .field("database_path", &self.config.database_path)
            .finish()
    }
}
