#![forbid(unsafe_code)]

pub mod authenticator;
pub mod config;
pub mod connectivity;
pub mod runtime;
pub mod session_manager;
pub mod sync_orchestrator;

pub use authenticator::{AuthError, Authenticator};
pub use config::{ConfigError, FieldSyncConfig};
pub use connectivity::{ConnectivityChange, ConnectivityWatch};
pub use runtime::{
    FieldSyncRuntime, LastDrain, RuntimeComponents, RuntimeError, RuntimeStatus, SessionSummary,
};
pub use session_manager::SessionManager;
pub use sync_orchestrator::{BackoffPolicy, SyncOrchestrator};
