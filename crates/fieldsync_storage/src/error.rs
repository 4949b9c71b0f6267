#![forbid(unsafe_code)]

use fieldsync_contracts::{ContractViolation, MutationId, MutationStatus};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("vault cryptographic operation failed")]
    Crypto,
    #[error("unsupported schema version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },
    #[error("corrupt {table} row: {reason}")]
    CorruptRow { table: &'static str, reason: String },
    #[error("mutation {0} not found")]
    MutationNotFound(MutationId),
    #[error("mutation {id} is {status:?}; operation requires {required}")]
    InvalidTransition {
        id: MutationId,
        status: MutationStatus,
        required: &'static str,
    },
    #[error("storage lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}
