//! Metadata store.
//!
//! Every write is transactional and version-guarded: each key carries a
//! counter that starts at 1 on create and grows by one on every write. A
//! writer names the versions it read; a mismatch fails the whole write with
//! `BadVersion` instead of overwriting a concurrent change.

mod memory;
mod schema;
mod sqlite;

use std::collections::BTreeMap;

use guestvisor_shared::GuestvisorResult;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Helper macro to convert rusqlite errors to GuestvisorError.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| guestvisor_shared::GuestvisorError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

/// Key to encoded value.
pub type Entries = BTreeMap<String, Vec<u8>>;

/// Key to the version the writer expects to find.
pub type Versions = BTreeMap<String, u64>;

/// A stored value with its current version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
}

pub trait Store: Send + Sync {
    /// Insert every key of `data`; fails with `KeyExists` if any is present.
    fn create(&self, data: &Entries) -> GuestvisorResult<()>;

    /// Write every key of `data` and remove every key of `removed` in one
    /// transaction. Keys listed in `versions` must currently be stored with
    /// exactly that version; written keys not listed are upserted.
    fn commit(&self, data: &Entries, removed: &[String], versions: &Versions) -> GuestvisorResult<()>;

    fn update(&self, data: &Entries, versions: &Versions) -> GuestvisorResult<()> {
        self.commit(data, &[], versions)
    }

    /// Remove `keys`. Keys listed in `versions` are checked first.
    fn delete(&self, keys: &[String], versions: &Versions) -> GuestvisorResult<()> {
        self.commit(&Entries::new(), keys, versions)
    }

    /// Fails with `NotFound` when the key is absent.
    fn get(&self, key: &str) -> GuestvisorResult<KeyValue>;

    /// All entries whose key starts with `prefix`, ordered by key.
    fn get_prefix(&self, prefix: &str) -> GuestvisorResult<Vec<KeyValue>>;
}
