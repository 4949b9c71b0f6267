#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use fieldsync_contracts::{
    ContractViolation, MutationId, MutationRecord, OperationKind, Session, SourceTier, SyncHalt,
    SyncReport, TargetResource, TenantId, UnixMs, UserId,
};
use fieldsync_engines::{
    AuthTier, BackendEndpoint, BackendProbe, CredentialHasher, DigestError, HttpAuthTier,
    HttpBackendProbe, HttpMutationSink, MutationSink, OfflineVaultTier, Reachability,
};
use fieldsync_storage::{CredentialVault, LedgerCounts, LocalStore, MutationLedger, StorageError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::authenticator::{AuthError, Authenticator};
use crate::config::{ConfigError, FieldSyncConfig};
use crate::session_manager::SessionManager;
use crate::sync_orchestrator::{BackoffPolicy, SyncOrchestrator};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Digest(#[from] DigestError),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("no active session; log in first")]
    NotAuthenticated,
}

/// Network-facing parts of a runtime. `http` builds the production set from config.
pub struct RuntimeComponents {
    pub remote: BackendEndpoint,
    pub probe: Arc<dyn BackendProbe>,
    pub sink: Arc<dyn MutationSink>,
    /// Online tiers in cascade order. The offline vault tier is always appended last.
    pub online_tiers: Vec<Box<dyn AuthTier>>,
    pub hasher: CredentialHasher,
    pub backoff: BackoffPolicy,
    pub expiry_margin_ms: u64,
}

impl RuntimeComponents {
    pub fn http(config: &FieldSyncConfig) -> Result<Self, RuntimeError> {
        let probe: Arc<dyn BackendProbe> = Arc::new(HttpBackendProbe::new(config.probe_timeouts));
        let remote = BackendEndpoint::new(SourceTier::Remote, config.remote_url.as_str());
        let mut online_tiers: Vec<Box<dyn AuthTier>> = vec![Box::new(HttpAuthTier::new(
            remote.clone(),
            probe.clone(),
            config.request_timeouts,
            config.tenant_id.clone(),
        ))];
        if let Some(local_url) = &config.local_url {
            online_tiers.push(Box::new(HttpAuthTier::new(
                BackendEndpoint::new(SourceTier::LocalNetwork, local_url.as_str()),
                probe.clone(),
                config.request_timeouts,
                config.tenant_id.clone(),
            )));
        }
        Ok(Self {
            sink: Arc::new(HttpMutationSink::new(remote.clone(), config.request_timeouts)),
            remote,
            probe,
            online_tiers,
            hasher: CredentialHasher::new(config.digest_iterations)?,
            backoff: config.backoff,
            expiry_margin_ms: config.expiry_margin_ms,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub role: String,
    pub tenant_id: TenantId,
    pub source_tier: SourceTier,
    pub token_expires_at: UnixMs,
    pub degraded: bool,
}

impl SessionSummary {
    pub fn from_session(session: &Session) -> Self {
        Self {
            user_id: session.user_id.clone(),
            display_name: session.display_name.clone(),
            role: session.role.clone(),
            tenant_id: session.tenant_id.clone(),
            source_tier: session.source_tier,
            token_expires_at: session.token_expires_at,
            degraded: session.is_degraded(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LastDrain {
    pub finished_at: UnixMs,
    pub report: SyncReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeStatus {
    pub session: Option<SessionSummary>,
    /// The session token is inside the expiry margin; the user should log in again.
    pub reauth_required: bool,
    pub ledger: LedgerCounts,
    pub last_drain: Option<LastDrain>,
}

/// Device-side engine: one store, one session, one drain at a time.
pub struct FieldSyncRuntime {
    ledger: MutationLedger,
    vault: CredentialVault,
    sessions: Arc<SessionManager>,
    authenticator: Authenticator,
    orchestrator: SyncOrchestrator,
    remote: BackendEndpoint,
    probe: Arc<dyn BackendProbe>,
    last_drain: Mutex<Option<LastDrain>>,
    reauth_required: Arc<AtomicBool>,
}

impl FieldSyncRuntime {
    pub fn open(config: &FieldSyncConfig) -> Result<Self, RuntimeError> {
        let store = LocalStore::open(config.store_path())?;
        let components = RuntimeComponents::http(config)?;
        info!(
            data_dir = %config.data_dir.display(),
            remote = %config.remote_url,
            local = config.local_url.as_deref().unwrap_or("-"),
            "fieldsync runtime opened"
        );
        Ok(Self::assemble(store, config.master_key_path(), components))
    }

    pub fn assemble(
        store: LocalStore,
        master_key_path: impl Into<PathBuf>,
        components: RuntimeComponents,
    ) -> Self {
        let RuntimeComponents {
            remote,
            probe,
            sink,
            mut online_tiers,
            hasher,
            backoff,
            expiry_margin_ms,
        } = components;
        let ledger = store.ledger();
        let vault = store.vault(master_key_path);
        let sessions = Arc::new(SessionManager::new(expiry_margin_ms));
        let reauth_required = Arc::new(AtomicBool::new(false));
        let flag = reauth_required.clone();
        sessions.on_expiring(move |session| {
            warn!(
                user_id = session.user_id.as_str(),
                expires_at_ms = session.token_expires_at.0,
                "session token expiring; re-authentication required"
            );
            flag.store(true, Ordering::SeqCst);
        });
        online_tiers.push(Box::new(OfflineVaultTier::new(vault.clone())));
        let authenticator = Authenticator::new(online_tiers, vault.clone(), hasher, sessions.clone());
        let orchestrator = SyncOrchestrator::new(
            ledger.clone(),
            remote.clone(),
            probe.clone(),
            sink,
            sessions.clone(),
            backoff,
        );
        Self {
            ledger,
            vault,
            sessions,
            authenticator,
            orchestrator,
            remote,
            probe,
            last_drain: Mutex::new(None),
            reauth_required,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn login(&self, email: &str, password: &str, now: UnixMs) -> Result<Session, RuntimeError> {
        let session = self.authenticator.login(email, password, now)?;
        self.reauth_required.store(false, Ordering::SeqCst);
        Ok(session)
    }

    pub fn reauth_required(&self) -> bool {
        self.reauth_required.load(Ordering::SeqCst) && self.sessions.current().is_some()
    }

    /// Ends the session. Cached credentials stay so the user can log in offline later.
    pub fn logout(&self) -> Option<Session> {
        self.end_session()
    }

    /// Ends the session and removes that user's cached credentials. Other users keep theirs.
    pub fn logout_and_wipe(&self) -> Result<Option<Session>, RuntimeError> {
        let session = self.end_session();
        if let Some(s) = &session {
            let wiped = self.vault.clear(&s.user_id)?;
            info!(user_id = s.user_id.as_str(), wiped, "logged out and wiped cached credentials");
        }
        Ok(session)
    }

    /// Ends the session and wipes every cached credential on this device.
    pub fn forget_device(&self) -> Result<usize, RuntimeError> {
        self.end_session();
        let removed = self.vault.clear_all()?;
        info!(removed, "device credentials forgotten");
        Ok(removed)
    }

    /// Queues a write for the remote store. It is durable once this returns.
    pub fn record_mutation(
        &self,
        now: UnixMs,
        target_resource: &str,
        operation_kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<MutationRecord, RuntimeError> {
        if self.sessions.current().is_none() {
            return Err(RuntimeError::NotAuthenticated);
        }
        let target = TargetResource::new(target_resource)?;
        self.ledger
            .append(now, target, operation_kind, payload)
            .map_err(|err| {
                error!(error = %err, "mutation could not be queued");
                RuntimeError::from(err)
            })
    }

    pub fn drain(&self, now: UnixMs, cancel: &CancellationToken) -> Result<SyncReport, RuntimeError> {
        let report = self.orchestrator.drain(now, cancel).map_err(|err| {
            error!(error = %err, "drain aborted by a storage failure");
            RuntimeError::from(err)
        })?;
        if report.halt == Some(SyncHalt::TokenRejected) {
            if let Some(session) = self.end_session() {
                warn!(
                    user_id = session.user_id.as_str(),
                    "session token rejected by remote; session cleared"
                );
            }
        }
        *self.last_drain.lock().unwrap_or_else(PoisonError::into_inner) = Some(LastDrain {
            finished_at: now,
            report,
        });
        Ok(report)
    }

    pub fn probe_remote(&self) -> Reachability {
        self.probe.probe(&self.remote)
    }

    pub fn status(&self) -> Result<RuntimeStatus, RuntimeError> {
        Ok(RuntimeStatus {
            session: self.sessions.current().as_ref().map(SessionSummary::from_session),
            reauth_required: self.reauth_required(),
            ledger: self.ledger.counts()?,
            last_drain: *self.last_drain.lock().unwrap_or_else(PoisonError::into_inner),
        })
    }

    pub fn failed_mutations(&self) -> Result<Vec<MutationRecord>, RuntimeError> {
        Ok(self.ledger.list_failed()?)
    }

    pub fn discard_failed(&self, id: MutationId) -> Result<(), RuntimeError> {
        Ok(self.ledger.discard(id)?)
    }

    pub fn purge_failed(&self) -> Result<usize, RuntimeError> {
        Ok(self.ledger.purge_failed()?)
    }

    pub fn compact(&self) -> Result<usize, RuntimeError> {
        Ok(self.ledger.compact_applied()?)
    }

    fn end_session(&self) -> Option<Session> {
        self.reauth_required.store(false, Ordering::SeqCst);
        self.sessions.clear()
    }
}
