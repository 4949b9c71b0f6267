#![forbid(unsafe_code)]

pub mod common;
pub mod mutation;
pub mod session;
pub mod vault;

pub use common::{ContractViolation, SchemaVersion, UnixMs, Validate};
pub use mutation::{
    MutationId, MutationRecord, MutationStatus, OperationKind, SyncHalt, SyncReport,
    TargetResource,
};
pub use session::{AccessToken, Email, Session, SourceTier, TenantId, UserId};
pub use vault::VaultEntry;
