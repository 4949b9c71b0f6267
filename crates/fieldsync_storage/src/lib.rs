#![forbid(unsafe_code)]

pub mod db;
pub mod error;
pub mod ledger;
pub mod vault;

pub use db::{LocalStore, STORE_SCHEMA_VERSION};
pub use error::StorageError;
pub use ledger::{FailureDisposition, LedgerCounts, MutationLedger};
pub use vault::CredentialVault;
