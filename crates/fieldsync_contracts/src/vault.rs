#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{ContractViolation, UnixMs, Validate};
use crate::session::{AccessToken, Email, Session, SourceTier, TenantId, UserId};

/// Last-known-good credential material for one user on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEntry {
    pub user_id: UserId,
    pub email: Email,
    pub tenant_id: TenantId,
    pub display_name: String,
    pub role: String,
    /// Encoded slow salted digest of the password, never the password itself.
    pub credential_digest: String,
    pub last_token: AccessToken,
    pub last_token_issued_at: UnixMs,
    pub last_token_expires_at: UnixMs,
    pub last_profile_snapshot: serde_json::Value,
    pub saved_at: UnixMs,
}

impl VaultEntry {
    /// Rebuilds the session an offline login hands to the UI. The token may be stale.
    pub fn to_offline_session(&self) -> Session {
        Session {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role.clone(),
            tenant_id: self.tenant_id.clone(),
            token: self.last_token.clone(),
            token_issued_at: self.last_token_issued_at,
            token_expires_at: self.last_token_expires_at,
            source_tier: SourceTier::OfflineCache,
        }
    }
}

impl Validate for VaultEntry {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.user_id.validate()?;
        self.tenant_id.validate()?;
        if self.credential_digest.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "credential_digest",
                reason: "must not be empty",
            });
        }
        if self.last_token_expires_at < self.last_token_issued_at {
            return Err(ContractViolation::InvalidValue {
                field: "last_token_expires_at",
                reason: "must not precede last_token_issued_at",
            });
        }
        Ok(())
    }
}
