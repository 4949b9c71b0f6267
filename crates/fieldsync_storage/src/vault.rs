#![forbid(unsafe_code)]

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use fieldsync_contracts::{Email, UserId, Validate, VaultEntry};
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::db::{lock, sql_ms, SharedConnection};
use crate::error::StorageError;

const SEALED_SCHEMA_VERSION: u8 = 1;
const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const EMAIL_KEY_DOMAIN: &str = "fieldsync.vault.email.v1:";

#[derive(Debug, Serialize, Deserialize)]
struct SealedDocument {
    schema_version: u8,
    entry: VaultEntry,
}

/// Encrypted cache of last-known-good credentials, one entry per user.
///
/// Only a SHA-256 lookup key of the email is stored in clear. Everything else is sealed with
/// AES-256-GCM under a device master key kept in a separate owner-only file, with the user id
/// bound in as associated data so rows cannot be swapped between users.
#[derive(Debug, Clone)]
pub struct CredentialVault {
    conn: SharedConnection,
    key_path: PathBuf,
}

impl CredentialVault {
    pub(crate) fn new(conn: SharedConnection, key_path: PathBuf) -> Self {
        Self { conn, key_path }
    }

    /// Upsert keyed by user id. Any stale entry for the same email under another user id is
    /// dropped in the same transaction.
    pub fn save(&self, entry: &VaultEntry) -> Result<(), StorageError> {
        entry.validate()?;
        let (nonce_b64, sealed_b64) = self.seal(entry)?;
        let email_key = email_lookup_key(&entry.email);
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let displaced = tx.execute(
            "DELETE FROM vault_entries WHERE email_key = ?1 AND user_id != ?2",
            params![email_key, entry.user_id.as_str()],
        )?;
        tx.execute(
            "INSERT INTO vault_entries (user_id, email_key, saved_at_ms, nonce_b64, sealed_b64)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (user_id) DO UPDATE SET
                email_key = excluded.email_key,
                saved_at_ms = excluded.saved_at_ms,
                nonce_b64 = excluded.nonce_b64,
                sealed_b64 = excluded.sealed_b64",
            params![
                entry.user_id.as_str(),
                email_key,
                sql_ms(entry.saved_at),
                nonce_b64,
                sealed_b64
            ],
        )?;
        tx.commit()?;
        if displaced > 0 {
            info!(
                user_id = entry.user_id.as_str(),
                displaced, "vault entry replaced a stale entry for the same email"
            );
        }
        debug!(user_id = entry.user_id.as_str(), "vault entry saved");
        Ok(())
    }

    pub fn lookup(&self, email: &Email) -> Result<Option<VaultEntry>, StorageError> {
        let email_key = email_lookup_key(email);
        let row = {
            let conn = lock(&self.conn)?;
            conn.query_row(
                "SELECT user_id, nonce_b64, sealed_b64 FROM vault_entries WHERE email_key = ?1",
                params![email_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
        };
        let Some((user_id, nonce_b64, sealed_b64)) = row else {
            return Ok(None);
        };
        let entry = self.open_sealed(&user_id, &nonce_b64, &sealed_b64)?;
        if entry.email != *email || entry.user_id.as_str() != user_id {
            warn!(user_id = %user_id, "vault entry does not match its lookup key");
            return Err(StorageError::Crypto);
        }
        Ok(Some(entry))
    }

    pub fn clear(&self, user_id: &UserId) -> Result<bool, StorageError> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute(
            "DELETE FROM vault_entries WHERE user_id = ?1",
            params![user_id.as_str()],
        )?;
        if removed > 0 {
            info!(user_id = user_id.as_str(), "vault entry cleared");
        }
        Ok(removed > 0)
    }

    /// Forget-this-device: drops every cached credential.
    pub fn clear_all(&self) -> Result<usize, StorageError> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute("DELETE FROM vault_entries", [])?;
        info!(removed, "vault wiped");
        Ok(removed)
    }

    pub fn entry_count(&self) -> Result<u32, StorageError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM vault_entries", [], |row| row.get(0))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn seal(&self, entry: &VaultEntry) -> Result<(String, String), StorageError> {
        let key = self.load_or_create_master_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| StorageError::Crypto)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let plaintext = serde_json::to_vec(&SealedDocument {
            schema_version: SEALED_SCHEMA_VERSION,
            entry: entry.clone(),
        })?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &plaintext,
                    aad: entry.user_id.as_str().as_bytes(),
                },
            )
            .map_err(|_| StorageError::Crypto)?;
        Ok((BASE64.encode(nonce_bytes), BASE64.encode(ciphertext)))
    }

    fn open_sealed(
        &self,
        user_id: &str,
        nonce_b64: &str,
        sealed_b64: &str,
    ) -> Result<VaultEntry, StorageError> {
        let key = self.load_master_key()?.ok_or(StorageError::Crypto)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| StorageError::Crypto)?;
        let nonce_raw = BASE64.decode(nonce_b64.as_bytes())?;
        if nonce_raw.len() != NONCE_LEN {
            return Err(StorageError::Crypto);
        }
        let ciphertext = BASE64.decode(sealed_b64.as_bytes())?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_raw),
                Payload {
                    msg: &ciphertext,
                    aad: user_id.as_bytes(),
                },
            )
            .map_err(|_| StorageError::Crypto)?;
        let doc: SealedDocument = serde_json::from_slice(&plaintext)?;
        if doc.schema_version != SEALED_SCHEMA_VERSION {
            return Err(StorageError::SchemaVersion {
                found: u32::from(doc.schema_version),
                expected: u32::from(SEALED_SCHEMA_VERSION),
            });
        }
        Ok(doc.entry)
    }

    /// Reads the device master key. A missing key file means nothing was ever sealed here.
    fn load_master_key(&self) -> Result<Option<[u8; MASTER_KEY_LEN]>, StorageError> {
        let encoded = match fs::read_to_string(&self.key_path) {
            Ok(encoded) => encoded,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let decoded = BASE64.decode(encoded.trim().as_bytes())?;
        if decoded.len() != MASTER_KEY_LEN {
            return Err(StorageError::Crypto);
        }
        let mut key = [0u8; MASTER_KEY_LEN];
        key.copy_from_slice(&decoded);
        Ok(Some(key))
    }

    /// The key is written to a private temp file and hard-linked into place, so a concurrent
    /// reader sees either no key file or a complete one. Losing the race means adopting the
    /// winner's key.
    fn load_or_create_master_key(&self) -> Result<[u8; MASTER_KEY_LEN], StorageError> {
        if let Some(key) = self.load_master_key()? {
            return Ok(key);
        }

        if let Some(parent) = self.key_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut key = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        let staged = self
            .key_path
            .with_extension(format!("tmp-{:016x}", OsRng.next_u64()));
        write_new_file_restricted(&staged, BASE64.encode(key).as_bytes())?;
        let published = fs::hard_link(&staged, &self.key_path);
        fs::remove_file(&staged)?;
        match published {
            Ok(()) => {
                info!(path = %self.key_path.display(), "vault master key created");
                Ok(key)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!("vault master key created concurrently; adopting it");
                self.load_master_key()?.ok_or(StorageError::Crypto)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn email_lookup_key(email: &Email) -> String {
    let mut hasher = Sha256::new();
    hasher.update(EMAIL_KEY_DOMAIN.as_bytes());
    hasher.update(email.as_str().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn write_new_file_restricted(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
