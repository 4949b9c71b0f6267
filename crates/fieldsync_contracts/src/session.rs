#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{validate_id, ContractViolation, UnixMs, Validate};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for UserId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("user_id", &self.0, 128)
    }
}

impl TryFrom<String> for UserId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for TenantId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("tenant_id", &self.0, 64)
    }
}

impl TryFrom<String> for TenantId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Login email, trimmed and ASCII-lowercased so vault lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        let normalized = raw.trim().to_ascii_lowercase();
        validate_id("email", &normalized, 254)?;
        let Some((local, domain)) = normalized.split_once('@') else {
            return Err(ContractViolation::InvalidValue {
                field: "email",
                reason: "must contain '@'",
            });
        };
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(ContractViolation::InvalidValue {
                field: "email",
                reason: "must be of the form local@domain",
            });
        }
        if normalized.chars().any(char::is_whitespace) {
            return Err(ContractViolation::InvalidValue {
                field: "email",
                reason: "must not contain whitespace",
            });
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Email {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Email> for String {
    fn from(value: Email) -> Self {
        value.0
    }
}

/// Bearer token issued by an online tier. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Result<Self, ContractViolation> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "token",
                reason: "must not be empty",
            });
        }
        if token.len() > 8_192 {
            return Err(ContractViolation::InvalidRange {
                field: "token",
                min: 1,
                max: 8_192,
                got: token.len() as u64,
            });
        }
        Ok(Self(token))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceTier {
    Remote,
    LocalNetwork,
    OfflineCache,
}

impl SourceTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "REMOTE",
            Self::LocalNetwork => "LOCAL_NETWORK",
            Self::OfflineCache => "OFFLINE_CACHE",
        }
    }

    /// Online tiers verified the password against a live authority.
    pub fn is_online(self) -> bool {
        !matches!(self, Self::OfflineCache)
    }
}

impl std::fmt::Display for SourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub display_name: String,
    pub role: String,
    pub tenant_id: TenantId,
    pub token: AccessToken,
    pub token_issued_at: UnixMs,
    pub token_expires_at: UnixMs,
    pub source_tier: SourceTier,
}

impl Session {
    pub fn is_expired(&self, now: UnixMs) -> bool {
        now >= self.token_expires_at
    }

    pub fn expires_within(&self, now: UnixMs, margin_ms: u64) -> bool {
        now >= self.token_expires_at.saturating_sub_ms(margin_ms)
    }

    /// Offline sessions unlock the local UI only; they carry no remote authority.
    pub fn is_degraded(&self) -> bool {
        !self.source_tier.is_online()
    }
}

impl Validate for Session {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.user_id.validate()?;
        self.tenant_id.validate()?;
        if self.display_name.len() > 256 {
            return Err(ContractViolation::InvalidRange {
                field: "display_name",
                min: 0,
                max: 256,
                got: self.display_name.len() as u64,
            });
        }
        if self.token_expires_at < self.token_issued_at {
            return Err(ContractViolation::InvalidValue {
                field: "token_expires_at",
                reason: "must not precede token_issued_at",
            });
        }
        Ok(())
    }
}
