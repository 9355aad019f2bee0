//! Version-tagged persistence of model records.
//!
//! Every record knows its key and the version it was loaded at. Writes name
//! those versions so a concurrent modification fails the writer; on success
//! the in-memory version is bumped to match the store.

use chrono::Utc;
use serde::de::DeserializeOwned;

use guestvisor_shared::{GuestvisorResult, ResultExt};

use crate::store::{Entries, Store, Versions};

/// A record persisted under a single metadata key.
pub trait Resource: Send + Sync {
    fn meta_key(&self) -> String;

    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    /// Refresh the update timestamp before a write.
    fn touch(&mut self, now: i64);

    fn encode(&self) -> GuestvisorResult<Vec<u8>>;
}

/// Insert new records plus bare marker keys in one transaction.
pub fn create(
    store: &dyn Store,
    resources: &mut [&mut dyn Resource],
    markers: &[String],
) -> GuestvisorResult<()> {
    let now = Utc::now().timestamp();
    let mut entries = Entries::new();
    for res in resources.iter_mut() {
        res.touch(now);
        entries.insert(res.meta_key(), res.encode()?);
    }
    for key in markers {
        entries.insert(key.clone(), Vec::new());
    }

    store.create(&entries).context("create metadata")?;

    for res in resources.iter_mut() {
        res.set_version(1);
    }
    Ok(())
}

/// Write records back, guarded by the versions they were loaded at.
pub fn save(store: &dyn Store, resources: &mut [&mut dyn Resource]) -> GuestvisorResult<()> {
    save_with_new(store, resources, &mut [])
}

/// Like [`save`], additionally inserting records that are not stored yet.
pub fn save_with_new(
    store: &dyn Store,
    resources: &mut [&mut dyn Resource],
    created: &mut [&mut dyn Resource],
) -> GuestvisorResult<()> {
    let now = Utc::now().timestamp();
    let mut entries = Entries::new();
    let mut versions = Versions::new();
    for res in resources.iter_mut() {
        res.touch(now);
        let key = res.meta_key();
        entries.insert(key.clone(), res.encode()?);
        versions.insert(key, res.version());
    }
    for res in created.iter_mut() {
        res.touch(now);
        entries.insert(res.meta_key(), res.encode()?);
    }

    store.update(&entries, &versions).context("save metadata")?;

    for res in resources.iter_mut() {
        let next = res.version() + 1;
        res.set_version(next);
    }
    for res in created.iter_mut() {
        res.set_version(1);
    }
    Ok(())
}

/// Write records back and remove `removed` in one transaction, every key
/// guarded by the version it was loaded at.
pub fn save_and_delete(
    store: &dyn Store,
    resources: &mut [&mut dyn Resource],
    removed: &[&dyn Resource],
) -> GuestvisorResult<()> {
    let now = Utc::now().timestamp();
    let mut entries = Entries::new();
    let mut versions = Versions::new();
    for res in resources.iter_mut() {
        res.touch(now);
        let key = res.meta_key();
        entries.insert(key.clone(), res.encode()?);
        versions.insert(key, res.version());
    }
    let mut keys = Vec::with_capacity(removed.len());
    for res in removed {
        let key = res.meta_key();
        versions.insert(key.clone(), res.version());
        keys.push(key);
    }

    store.commit(&entries, &keys, &versions).context("save metadata")?;

    for res in resources.iter_mut() {
        let next = res.version() + 1;
        res.set_version(next);
    }
    Ok(())
}

/// Decode the record stored at `key`, returning it with its version.
pub fn load<R: DeserializeOwned>(store: &dyn Store, key: &str) -> GuestvisorResult<(R, u64)> {
    let kv = store.get(key)?;
    let record = serde_json::from_slice(&kv.value)?;
    Ok((record, kv.version))
}

/// Remove records (version-guarded) and extra keys (unconditionally).
pub fn delete(
    store: &dyn Store,
    resources: &[&dyn Resource],
    extra_keys: &[String],
) -> GuestvisorResult<()> {
    let mut keys = Vec::with_capacity(resources.len() + extra_keys.len());
    let mut versions = Versions::new();
    for res in resources {
        let key = res.meta_key();
        versions.insert(key.clone(), res.version());
        keys.push(key);
    }
    keys.extend(extra_keys.iter().cloned());

    store.delete(&keys, &versions).context("delete metadata")
}
