use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use guestvisor_shared::{GuestvisorError, GuestvisorResult};

use super::{Entries, KeyValue, Store, Versions};

/// In-process store with the same version semantics as [`super::SqliteStore`].
///
/// Used by tests and for ephemeral runs where nothing must survive a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<BTreeMap<String, (Vec<u8>, u64)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }
}

fn check_versions(
    data: &BTreeMap<String, (Vec<u8>, u64)>,
    versions: &Versions,
) -> GuestvisorResult<()> {
    for (key, expected) in versions {
        match data.get(key) {
            Some((_, actual)) if actual == expected => {}
            _ => return Err(GuestvisorError::BadVersion(key.clone())),
        }
    }
    Ok(())
}

impl Store for MemoryStore {
    fn create(&self, entries: &Entries) -> GuestvisorResult<()> {
        let mut data = self.data.lock();
        if let Some(key) = entries.keys().find(|k| data.contains_key(*k)) {
            return Err(GuestvisorError::KeyExists(key.clone()));
        }
        for (key, value) in entries {
            data.insert(key.clone(), (value.clone(), 1));
        }
        Ok(())
    }

    fn commit(&self, entries: &Entries, removed: &[String], versions: &Versions) -> GuestvisorResult<()> {
        let mut data = self.data.lock();
        check_versions(&data, versions)?;
        for (key, value) in entries {
            let next = data.get(key).map(|(_, v)| v + 1).unwrap_or(1);
            data.insert(key.clone(), (value.clone(), next));
        }
        for key in removed {
            data.remove(key);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> GuestvisorResult<KeyValue> {
        let data = self.data.lock();
        let (value, version) = data
            .get(key)
            .ok_or_else(|| GuestvisorError::NotFound(key.to_string()))?;
        Ok(KeyValue {
            key: key.to_string(),
            value: value.clone(),
            version: *version,
        })
    }

    fn get_prefix(&self, prefix: &str) -> GuestvisorResult<Vec<KeyValue>> {
        let data = self.data.lock();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (value, version))| KeyValue {
                key: k.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect())
    }
}
