//! SQLite-backed metadata store.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use guestvisor_shared::{GuestvisorError, GuestvisorResult};

use super::{Entries, KeyValue, Store, Versions, db_err, schema};

/// Durable store on a single SQLite file.
///
/// Thread-safe via `parking_lot::Mutex`; each write runs in one transaction so
/// a version mismatch on any key leaves every key untouched.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish()
    }
}

impl SqliteStore {
    /// Open or create the database.
    pub fn open(db_path: &Path) -> GuestvisorResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;

        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA busy_timeout=100000;
            "
        ))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> GuestvisorResult<()> {
        for sql in schema::all_schemas() {
            db_err!(conn.execute_batch(sql))?;
        }

        let current_version: Option<i32> = db_err!(
            conn.query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
        )?;

        match current_version {
            None => {
                let now = Utc::now().to_rfc3339();
                db_err!(conn.execute(
                    "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                    params![schema::SCHEMA_VERSION, now],
                ))?;
                tracing::info!(
                    "Initialized metadata schema version {}",
                    schema::SCHEMA_VERSION
                );
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(GuestvisorError::Database(format!(
                    "metadata schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }

    fn version_of(tx: &Transaction<'_>, key: &str) -> GuestvisorResult<Option<u64>> {
        let version: Option<i64> = db_err!(
            tx.query_row("SELECT version FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
        )?;
        Ok(version.map(|v| v as u64))
    }

    fn check_versions(tx: &Transaction<'_>, versions: &Versions) -> GuestvisorResult<()> {
        for (key, expected) in versions {
            match Self::version_of(tx, key)? {
                Some(actual) if actual == *expected => {}
                _ => return Err(GuestvisorError::BadVersion(key.clone())),
            }
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn create(&self, data: &Entries) -> GuestvisorResult<()> {
        let mut conn = self.conn.lock();
        let tx = db_err!(conn.transaction())?;
        let now = Utc::now().to_rfc3339();

        for (key, value) in data {
            if Self::version_of(&tx, key)?.is_some() {
                return Err(GuestvisorError::KeyExists(key.clone()));
            }
            db_err!(tx.execute(
                "INSERT INTO kv (key, value, version, updated_at) VALUES (?1, ?2, 1, ?3)",
                params![key, value, now],
            ))?;
        }

        db_err!(tx.commit())
    }

    fn commit(&self, data: &Entries, removed: &[String], versions: &Versions) -> GuestvisorResult<()> {
        let mut conn = self.conn.lock();
        let tx = db_err!(conn.transaction())?;
        Self::check_versions(&tx, versions)?;

        let now = Utc::now().to_rfc3339();
        for (key, value) in data {
            db_err!(tx.execute(
                "INSERT INTO kv (key, value, version, updated_at) VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    version = kv.version + 1,
                    updated_at = excluded.updated_at",
                params![key, value, now],
            ))?;
        }
        for key in removed {
            db_err!(tx.execute("DELETE FROM kv WHERE key = ?1", [key]))?;
        }

        db_err!(tx.commit())
    }

    fn get(&self, key: &str) -> GuestvisorResult<KeyValue> {
        let conn = self.conn.lock();
        let row: Option<(Vec<u8>, i64)> = db_err!(
            conn.query_row(
                "SELECT value, version FROM kv WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        )?;

        let (value, version) = row.ok_or_else(|| GuestvisorError::NotFound(key.to_string()))?;
        Ok(KeyValue {
            key: key.to_string(),
            value,
            version: version as u64,
        })
    }

    fn get_prefix(&self, prefix: &str) -> GuestvisorResult<Vec<KeyValue>> {
        let conn = self.conn.lock();
        let mut stmt = db_err!(conn.prepare(
            "SELECT key, value, version FROM kv
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key"
        ))?;

        let rows = db_err!(stmt.query_map([prefix], |row| {
            let version: i64 = row.get(2)?;
            Ok(KeyValue {
                key: row.get(0)?,
                value: row.get(1)?,
                version: version as u64,
            })
        }))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(db_err!(row)?);
        }
        Ok(entries)
    }
}
