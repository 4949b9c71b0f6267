#![forbid(unsafe_code)]

use std::sync::Arc;

use fieldsync_contracts::{
    AccessToken, ContractViolation, Email, Session, SourceTier, TenantId, UnixMs, UserId,
    VaultEntry,
};
use fieldsync_storage::CredentialVault;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend_probe::{BackendProbe, Reachability};
use crate::credential_digest::verify_password;
use crate::http::{bounded_message, BackendEndpoint, HttpTimeouts};

pub const LOGIN_PATH: &str = "/v1/auth/login";
pub const TOKEN_TTL_MS_DEFAULT: u64 = 8 * 60 * 60 * 1_000;

/// Login input. The password is only ever held in memory for the duration of one login.
#[derive(Clone)]
pub struct Credentials {
    pub email: Email,
    password: String,
}

impl Credentials {
    pub fn new(email: Email, password: impl Into<String>) -> Result<Self, ContractViolation> {
        let password = password.into();
        if password.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "password",
                reason: "must not be empty",
            });
        }
        Ok(Self { email, password })
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identity and token an authority vouched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub user_id: UserId,
    pub display_name: String,
    pub role: String,
    pub tenant_id: TenantId,
    pub token: AccessToken,
    pub issued_at: UnixMs,
    pub expires_at: UnixMs,
    pub profile_snapshot: serde_json::Value,
}

impl AuthGrant {
    pub fn into_session(self, tier: SourceTier) -> Session {
        Session {
            user_id: self.user_id,
            display_name: self.display_name,
            role: self.role,
            tenant_id: self.tenant_id,
            token: self.token,
            token_issued_at: self.issued_at,
            token_expires_at: self.expires_at,
            source_tier: tier,
        }
    }

    pub fn to_vault_entry(&self, email: Email, credential_digest: String, now: UnixMs) -> VaultEntry {
        VaultEntry {
            user_id: self.user_id.clone(),
            email,
            tenant_id: self.tenant_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role.clone(),
            credential_digest,
            last_token: self.token.clone(),
            last_token_issued_at: self.issued_at,
            last_token_expires_at: self.expires_at,
            last_profile_snapshot: self.profile_snapshot.clone(),
            saved_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierRejection {
    /// A live authority refused this identity.
    InvalidCredentials,
    /// A live authority answered with a request-specific error.
    RequestError { status: u16, message: String },
    /// No usable cached credential on this device.
    VaultMiss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierOutcome {
    Authenticated(AuthGrant),
    Rejected(TierRejection),
    Unreachable(String),
}

/// One link of the login cascade.
pub trait AuthTier: Send + Sync {
    fn tier(&self) -> SourceTier;
    fn attempt(&self, credentials: &Credentials, now: UnixMs) -> TierOutcome;
}

#[derive(Debug, Serialize)]
struct LoginRequestBody<'a> {
    email: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct LoginResponseBody {
    user_id: String,
    display_name: String,
    #[serde(default)]
    role: String,
    tenant_id: String,
    token: String,
    #[serde(default)]
    issued_at_ms: Option<u64>,
    #[serde(default)]
    expires_at_ms: Option<u64>,
    #[serde(default)]
    profile: serde_json::Value,
}

impl LoginResponseBody {
    fn into_grant(self, now: UnixMs) -> Result<AuthGrant, ContractViolation> {
        let issued_at = self.issued_at_ms.map(UnixMs).unwrap_or(now);
        let expires_at = self
            .expires_at_ms
            .map(UnixMs)
            .unwrap_or_else(|| issued_at.saturating_add_ms(TOKEN_TTL_MS_DEFAULT));
        if expires_at < issued_at {
            return Err(ContractViolation::InvalidValue {
                field: "expires_at_ms",
                reason: "must not precede issued_at_ms",
            });
        }
        let profile_snapshot = if self.profile.is_null() {
            serde_json::json!({
                "user_id": self.user_id,
                "display_name": self.display_name,
                "role": self.role,
                "tenant_id": self.tenant_id,
            })
        } else {
            self.profile
        };
        Ok(AuthGrant {
            user_id: UserId::new(self.user_id)?,
            display_name: self.display_name,
            role: self.role,
            tenant_id: TenantId::new(self.tenant_id)?,
            token: AccessToken::new(self.token)?,
            issued_at,
            expires_at,
            profile_snapshot,
        })
    }
}

/// Remote or local-network login endpoint. Probes before every attempt.
pub struct HttpAuthTier {
    endpoint: BackendEndpoint,
    probe: Arc<dyn BackendProbe>,
    timeouts: HttpTimeouts,
    tenant_id: Option<TenantId>,
}

impl HttpAuthTier {
    pub fn new(
        endpoint: BackendEndpoint,
        probe: Arc<dyn BackendProbe>,
        timeouts: HttpTimeouts,
        tenant_id: Option<TenantId>,
    ) -> Self {
        Self {
            endpoint,
            probe,
            timeouts,
            tenant_id,
        }
    }

    pub fn endpoint(&self) -> &BackendEndpoint {
        &self.endpoint
    }
}

impl AuthTier for HttpAuthTier {
    fn tier(&self) -> SourceTier {
        self.endpoint.tier
    }

    fn attempt(&self, credentials: &Credentials, now: UnixMs) -> TierOutcome {
        if let Reachability::Unreachable(reason) = self.probe.probe(&self.endpoint) {
            return TierOutcome::Unreachable(reason);
        }
        let body = LoginRequestBody {
            email: credentials.email.as_str(),
            password: credentials.password(),
            tenant_id: self.tenant_id.as_ref().map(TenantId::as_str),
        };
        let result = self
            .timeouts
            .agent()
            .post(&self.endpoint.url(LOGIN_PATH))
            .set("accept", "application/json")
            .send_json(&body);
        match result {
            Ok(resp) => match resp.into_json::<LoginResponseBody>() {
                Ok(parsed) => match parsed.into_grant(now) {
                    Ok(grant) => TierOutcome::Authenticated(grant),
                    Err(violation) => {
                        warn!(tier = %self.endpoint.tier, %violation, "login grant failed validation");
                        TierOutcome::Unreachable(bounded_message(format!(
                            "malformed grant: {violation}"
                        )))
                    }
                },
                Err(err) => TierOutcome::Unreachable(bounded_message(format!(
                    "unreadable grant: {err}"
                ))),
            },
            Err(ureq::Error::Status(code, resp)) => {
                let message = resp.into_string().unwrap_or_default();
                classify_login_status(code, message)
            }
            Err(ureq::Error::Transport(err)) => {
                debug!(tier = %self.endpoint.tier, "login transport failure");
                TierOutcome::Unreachable(bounded_message(format!("transport: {err}")))
            }
        }
    }
}

/// Maps a non-2xx login answer. Only server-side failures fall through to the next tier.
pub fn classify_login_status(status: u16, message: String) -> TierOutcome {
    match status {
        401 | 403 => TierOutcome::Rejected(TierRejection::InvalidCredentials),
        408 | 429 => TierOutcome::Unreachable(format!("http status {status}")),
        s if s >= 500 => TierOutcome::Unreachable(format!("http status {s}")),
        s => TierOutcome::Rejected(TierRejection::RequestError {
            status: s,
            message: bounded_message(message),
        }),
    }
}

/// Last tier: verifies against the device vault without any network.
pub struct OfflineVaultTier {
    vault: CredentialVault,
}

impl OfflineVaultTier {
    pub fn new(vault: CredentialVault) -> Self {
        Self { vault }
    }
}

impl AuthTier for OfflineVaultTier {
    fn tier(&self) -> SourceTier {
        SourceTier::OfflineCache
    }

    fn attempt(&self, credentials: &Credentials, _now: UnixMs) -> TierOutcome {
        let entry = match self.vault.lookup(&credentials.email) {
            Ok(Some(entry)) => entry,
            Ok(None) => return TierOutcome::Rejected(TierRejection::VaultMiss),
            Err(err) => {
                warn!(error = %err, "vault lookup failed; treating as vault miss");
                return TierOutcome::Rejected(TierRejection::VaultMiss);
            }
        };
        match verify_password(credentials.password(), &entry.credential_digest) {
            Ok(true) => TierOutcome::Authenticated(AuthGrant {
                user_id: entry.user_id,
                display_name: entry.display_name,
                role: entry.role,
                tenant_id: entry.tenant_id,
                token: entry.last_token,
                issued_at: entry.last_token_issued_at,
                expires_at: entry.last_token_expires_at,
                profile_snapshot: entry.last_profile_snapshot,
            }),
            Ok(false) => TierOutcome::Rejected(TierRejection::VaultMiss),
            Err(err) => {
                warn!(error = %err, "cached credential digest unusable");
                TierOutcome::Rejected(TierRejection::VaultMiss)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_digest::{CredentialHasher, DIGEST_MIN_ITERATIONS};
    use fieldsync_storage::LocalStore;
    use serde_json::json;

    fn creds(email: &str, pw: &str) -> Credentials {
        Credentials::new(Email::parse(email).unwrap(), pw).unwrap()
    }

    fn grant() -> AuthGrant {
        AuthGrant {
            user_id: UserId::new("u-1").unwrap(),
            display_name: "Ada".to_string(),
            role: "technician".to_string(),
            tenant_id: TenantId::new("t-1").unwrap(),
            token: AccessToken::new("tok-1").unwrap(),
            issued_at: UnixMs(1_000),
            expires_at: UnixMs(9_000),
            profile_snapshot: json!({"team": "north"}),
        }
    }

    #[test]
    fn at_auth_tier_01_login_status_classification() {
        assert_eq!(
            classify_login_status(401, String::new()),
            TierOutcome::Rejected(TierRejection::InvalidCredentials)
        );
        assert_eq!(
            classify_login_status(403, String::new()),
            TierOutcome::Rejected(TierRejection::InvalidCredentials)
        );
        assert!(matches!(
            classify_login_status(422, "tenant missing".to_string()),
            TierOutcome::Rejected(TierRejection::RequestError { status: 422, .. })
        ));
        assert!(matches!(
            classify_login_status(503, String::new()),
            TierOutcome::Unreachable(_)
        ));
        assert!(matches!(
            classify_login_status(429, String::new()),
            TierOutcome::Unreachable(_)
        ));
    }

    #[test]
    fn at_auth_tier_02_grant_body_defaults_and_validation() {
        let body: LoginResponseBody = serde_json::from_value(json!({
            "user_id": "u-1",
            "display_name": "Ada",
            "tenant_id": "t-1",
            "token": "tok"
        }))
        .unwrap();
        let grant = body.into_grant(UnixMs(5_000)).unwrap();
        assert_eq!(grant.issued_at, UnixMs(5_000));
        assert_eq!(grant.expires_at, UnixMs(5_000 + TOKEN_TTL_MS_DEFAULT));
        assert_eq!(grant.profile_snapshot["display_name"], "Ada");

        let bad: LoginResponseBody = serde_json::from_value(json!({
            "user_id": "u-1",
            "display_name": "Ada",
            "tenant_id": "t-1",
            "token": "",
        }))
        .unwrap();
        assert!(bad.into_grant(UnixMs(1)).is_err());
    }

    #[test]
    fn at_auth_tier_03_credentials_debug_hides_password() {
        let c = creds("a@x.com", "hunter2");
        assert!(!format!("{c:?}").contains("hunter2"));
        assert!(Credentials::new(Email::parse("a@x.com").unwrap(), "").is_err());
    }

    #[test]
    fn at_auth_tier_04_offline_tier_verifies_against_vault() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("fieldsync.db")).unwrap();
        let vault = store.vault(dir.path().join("vault.master.key"));
        let digest = CredentialHasher::new(DIGEST_MIN_ITERATIONS)
            .unwrap()
            .hash("pw-a")
            .unwrap();
        vault
            .save(&grant().to_vault_entry(Email::parse("a@x.com").unwrap(), digest, UnixMs(1_000)))
            .unwrap();
        let tier = OfflineVaultTier::new(vault);

        match tier.attempt(&creds("a@x.com", "pw-a"), UnixMs(2_000)) {
            TierOutcome::Authenticated(g) => {
                assert_eq!(g.user_id.as_str(), "u-1");
                assert_eq!(g.token.expose(), "tok-1");
                assert_eq!(g.profile_snapshot, json!({"team": "north"}));
            }
            other => panic!("expected offline grant, got {other:?}"),
        }
        assert_eq!(
            tier.attempt(&creds("a@x.com", "wrong"), UnixMs(2_000)),
            TierOutcome::Rejected(TierRejection::VaultMiss)
        );
        assert_eq!(
            tier.attempt(&creds("b@x.com", "pw-a"), UnixMs(2_000)),
            TierOutcome::Rejected(TierRejection::VaultMiss)
        );
    }

    struct DownProbe;

    impl BackendProbe for DownProbe {
        fn probe(&self, _endpoint: &BackendEndpoint) -> Reachability {
            Reachability::Unreachable("probe: down".to_string())
        }
    }

    #[test]
    fn at_auth_tier_05_http_tier_short_circuits_on_failed_probe() {
        let tier = HttpAuthTier::new(
            BackendEndpoint::new(SourceTier::Remote, "http://127.0.0.1:9"),
            Arc::new(DownProbe),
            HttpTimeouts::request_default(),
            None,
        );
        assert_eq!(tier.tier(), SourceTier::Remote);
        assert_eq!(
            tier.attempt(&creds("a@x.com", "pw"), UnixMs(1)),
            TierOutcome::Unreachable("probe: down".to_string())
        );
    }
}
