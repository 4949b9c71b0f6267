#![forbid(unsafe_code)]

pub mod auth_tier;
pub mod backend_probe;
pub mod credential_digest;
pub mod http;
pub mod mutation_sink;

pub use auth_tier::{
    AuthGrant, AuthTier, Credentials, HttpAuthTier, OfflineVaultTier, TierOutcome, TierRejection,
};
pub use backend_probe::{BackendProbe, HttpBackendProbe, Reachability};
pub use credential_digest::{verify_password, CredentialHasher, DigestError};
pub use http::{BackendEndpoint, HttpTimeouts};
pub use mutation_sink::{HttpMutationSink, MutationEnvelope, MutationSink, SubmitOutcome};
