#![forbid(unsafe_code)]

use std::sync::Arc;

use fieldsync_contracts::{ContractViolation, Email, Session, SourceTier, UnixMs};
use fieldsync_engines::{
    AuthGrant, AuthTier, CredentialHasher, Credentials, TierOutcome, TierRejection,
};
use fieldsync_storage::CredentialVault;
use tracing::{info, warn};

use crate::session_manager::SessionManager;

/// Network attempts per tier before falling through to the next one.
pub const TIER_NETWORK_ATTEMPTS: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("credentials rejected by {tier}")]
    CredentialRejected { tier: SourceTier },
    #[error("{tier} refused the login request with status {status}: {message}")]
    RequestRejected {
        tier: SourceTier,
        status: u16,
        message: String,
    },
    #[error("no cached credentials match on this device")]
    VaultMiss,
    #[error("no authentication tier is reachable: {0}")]
    Unreachable(String),
    #[error("invalid login input: {0}")]
    InvalidInput(#[from] ContractViolation),
}

impl AuthError {
    /// Tier that produced the answer, if a live or cached authority spoke.
    pub fn tier(&self) -> Option<SourceTier> {
        match self {
            Self::CredentialRejected { tier } | Self::RequestRejected { tier, .. } => Some(*tier),
            Self::VaultMiss => Some(SourceTier::OfflineCache),
            _ => None,
        }
    }
}

/// Ordered login cascade: each tier is consulted only when every tier before it was unreachable.
pub struct Authenticator {
    tiers: Vec<Box<dyn AuthTier>>,
    vault: CredentialVault,
    hasher: CredentialHasher,
    sessions: Arc<SessionManager>,
}

impl Authenticator {
    pub fn new(
        tiers: Vec<Box<dyn AuthTier>>,
        vault: CredentialVault,
        hasher: CredentialHasher,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            tiers,
            vault,
            hasher,
            sessions,
        }
    }

    pub fn tiers(&self) -> Vec<SourceTier> {
        self.tiers.iter().map(|t| t.tier()).collect()
    }

    pub fn login(&self, email: &str, password: &str, now: UnixMs) -> Result<Session, AuthError> {
        let credentials = Credentials::new(Email::parse(email)?, password)?;
        let mut unreachable = Vec::new();
        for tier in &self.tiers {
            let source = tier.tier();
            let mut outcome = tier.attempt(&credentials, now);
            let mut attempts = 1;
            while attempts < TIER_NETWORK_ATTEMPTS && matches!(outcome, TierOutcome::Unreachable(_)) {
                outcome = tier.attempt(&credentials, now);
                attempts += 1;
            }
            match outcome {
                TierOutcome::Authenticated(grant) => {
                    return Ok(self.complete(&credentials, grant, source, now));
                }
                TierOutcome::Unreachable(reason) => {
                    info!(tier = %source, attempts, %reason, "tier unreachable; falling through");
                    unreachable.push(format!("{source}: {reason}"));
                }
                TierOutcome::Rejected(rejection) => {
                    info!(tier = %source, ?rejection, "login rejected");
                    return Err(match rejection {
                        TierRejection::InvalidCredentials => {
                            AuthError::CredentialRejected { tier: source }
                        }
                        TierRejection::RequestError { status, message } => {
                            AuthError::RequestRejected {
                                tier: source,
                                status,
                                message,
                            }
                        }
                        TierRejection::VaultMiss => AuthError::VaultMiss,
                    });
                }
            }
        }
        Err(AuthError::Unreachable(unreachable.join("; ")))
    }

    fn complete(
        &self,
        credentials: &Credentials,
        grant: AuthGrant,
        tier: SourceTier,
        now: UnixMs,
    ) -> Session {
        if tier.is_online() {
            self.remember(credentials, &grant, now);
        }
        let session = grant.into_session(tier);
        self.sessions.set(session.clone());
        session
    }

    /// Vault failures after an online success are logged; the online authority already answered.
    fn remember(&self, credentials: &Credentials, grant: &AuthGrant, now: UnixMs) {
        let digest = match self.hasher.hash(credentials.password()) {
            Ok(d) => d,
            Err(err) => {
                warn!(error = %err, "could not digest credentials for offline use");
                return;
            }
        };
        let entry = grant.to_vault_entry(credentials.email.clone(), digest, now);
        if let Err(err) = self.vault.save(&entry) {
            warn!(user_id = grant.user_id.as_str(), error = %err, "vault write failed after online login");
        }
    }
}
