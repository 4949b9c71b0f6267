#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use fieldsync_contracts::{SchemaVersion, UnixMs};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::StorageError;
use crate::ledger::{recover_in_flight_rows, MutationLedger};
use crate::vault::CredentialVault;

pub const STORE_SCHEMA_VERSION: SchemaVersion = SchemaVersion(1);

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS mutation_ledger (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    mutation_id TEXT NOT NULL UNIQUE,
    created_at_ms INTEGER NOT NULL,
    target_resource TEXT NOT NULL,
    operation_kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_attempt_at_ms INTEGER,
    last_error TEXT,
    status TEXT NOT NULL,
    next_attempt_at_ms INTEGER
);
CREATE INDEX IF NOT EXISTS mutation_ledger_status_seq ON mutation_ledger (status, seq);
CREATE TABLE IF NOT EXISTS vault_entries (
    user_id TEXT PRIMARY KEY,
    email_key TEXT NOT NULL UNIQUE,
    saved_at_ms INTEGER NOT NULL,
    nonce_b64 TEXT NOT NULL,
    sealed_b64 TEXT NOT NULL
);
";

pub(crate) type SharedConnection = Arc<Mutex<Connection>>;

/// SQLite integers are signed; instants past `i64::MAX` are pinned there instead of wrapping.
pub(crate) fn sql_ms(at: UnixMs) -> i64 {
    i64::try_from(at.0).unwrap_or(i64::MAX)
}

pub(crate) fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock().map_err(|_| StorageError::LockPoisoned)
}

/// Local durable store holding the credential vault and the mutation ledger.
///
/// Both share one connection so every write is serialized behind a single lock. Opening a
/// file-backed store resets mutations a previous process left IN_FLIGHT back to PENDING.
#[derive(Debug, Clone)]
pub struct LocalStore {
    conn: SharedConnection,
    path: Option<PathBuf>,
}

impl LocalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL; PRAGMA foreign_keys = ON;",
        )?;
        bootstrap(&conn)?;
        let recovered = recover_in_flight_rows(&conn)?;
        debug!(path = %path.display(), recovered, "local store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        bootstrap(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn ledger(&self) -> MutationLedger {
        MutationLedger::new(self.conn.clone())
    }

    pub fn vault(&self, master_key_path: impl Into<PathBuf>) -> CredentialVault {
        CredentialVault::new(self.conn.clone(), master_key_path.into())
    }

    pub fn schema_version(&self) -> Result<SchemaVersion, StorageError> {
        let conn = lock(&self.conn)?;
        read_schema_version(&conn)?.ok_or(StorageError::SchemaVersion {
            found: 0,
            expected: STORE_SCHEMA_VERSION.0,
        })
    }
}

fn bootstrap(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(SCHEMA_SQL)?;
    match read_schema_version(conn)? {
        None => {
            conn.execute(
                "INSERT INTO schema_meta (id, version) VALUES (1, ?1)",
                params![STORE_SCHEMA_VERSION.0],
            )?;
        }
        Some(found) if found == STORE_SCHEMA_VERSION => {}
        Some(found) => {
            return Err(StorageError::SchemaVersion {
                found: found.0,
                expected: STORE_SCHEMA_VERSION.0,
            });
        }
    }
    Ok(())
}

fn read_schema_version(conn: &Connection) -> Result<Option<SchemaVersion>, StorageError> {
    let version = conn
        .query_row("SELECT version FROM schema_meta WHERE id = 1", [], |row| {
            row.get::<_, u32>(0)
        })
        .optional()?;
    Ok(version.map(SchemaVersion))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_db_01_bootstrap_is_idempotent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fieldsync.db");
        {
            let store = LocalStore::open(&path).unwrap();
            assert_eq!(store.schema_version().unwrap(), STORE_SCHEMA_VERSION);
        }
        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.schema_version().unwrap(), STORE_SCHEMA_VERSION);
        assert_eq!(reopened.path(), Some(path.as_path()));
    }

    #[test]
    fn at_db_02_unknown_schema_version_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldsync.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(SCHEMA_SQL).unwrap();
            conn.execute("INSERT INTO schema_meta (id, version) VALUES (1, 99)", [])
                .unwrap();
        }
        let err = LocalStore::open(&path).expect_err("future schema must be rejected");
        assert!(matches!(
            err,
            StorageError::SchemaVersion { found: 99, expected: 1 }
        ));
    }
}
