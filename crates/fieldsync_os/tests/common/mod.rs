#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fieldsync_contracts::{
    AccessToken, MutationId, OperationKind, SourceTier, TenantId, UnixMs, UserId,
};
use fieldsync_engines::credential_digest::DIGEST_MIN_ITERATIONS;
use fieldsync_engines::{
    AuthGrant, AuthTier, BackendEndpoint, BackendProbe, CredentialHasher, Credentials,
    MutationEnvelope, MutationSink, Reachability, SubmitOutcome, TierOutcome, TierRejection,
};
use fieldsync_os::{BackoffPolicy, FieldSyncRuntime, RuntimeComponents};
use fieldsync_storage::LocalStore;
use serde_json::json;
use tempfile::TempDir;

pub const NOW: UnixMs = UnixMs(1_000_000);
pub const FAR_FUTURE: UnixMs = UnixMs(10_000_000_000);

pub fn grant(user: &str, display_name: &str, token: &str) -> AuthGrant {
    AuthGrant {
        user_id: UserId::new(user).unwrap(),
        display_name: display_name.to_string(),
        role: "technician".to_string(),
        tenant_id: TenantId::new("acme").unwrap(),
        token: AccessToken::new(token).unwrap(),
        issued_at: NOW,
        expires_at: FAR_FUTURE,
        profile_snapshot: json!({ "display_name": display_name }),
    }
}

/// Reachability switch for the sync endpoint.
#[derive(Default)]
pub struct SwitchProbe {
    pub down: AtomicBool,
    pub calls: AtomicUsize,
}

impl SwitchProbe {
    pub fn set_reachable(&self, up: bool) {
        self.down.store(!up, Ordering::SeqCst);
    }
}

impl BackendProbe for SwitchProbe {
    fn probe(&self, _endpoint: &BackendEndpoint) -> Reachability {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Reachability::Unreachable("connection refused".to_string())
        } else {
            Reachability::Reachable
        }
    }
}

/// In-memory login authority for one tier.
pub struct FakeLoginTier {
    pub tier: SourceTier,
    pub up: AtomicBool,
    pub calls: AtomicUsize,
    accounts: Mutex<HashMap<String, (String, AuthGrant)>>,
}

impl FakeLoginTier {
    pub fn new(tier: SourceTier) -> Self {
        Self {
            tier,
            up: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_reachable(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn register(&self, email: &str, password: &str, grant: AuthGrant) {
        self.accounts
            .lock()
            .unwrap()
            .insert(email.to_string(), (password.to_string(), grant));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub struct TierHandle(pub Arc<FakeLoginTier>);

impl AuthTier for TierHandle {
    fn tier(&self) -> SourceTier {
        self.0.tier
    }

    fn attempt(&self, credentials: &Credentials, _now: UnixMs) -> TierOutcome {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        if !self.0.up.load(Ordering::SeqCst) {
            return TierOutcome::Unreachable("connection refused".to_string());
        }
        match self.0.accounts.lock().unwrap().get(credentials.email.as_str()) {
            Some((password, grant)) if password == credentials.password() => {
                TierOutcome::Authenticated(grant.clone())
            }
            _ => TierOutcome::Rejected(TierRejection::InvalidCredentials),
        }
    }
}

/// Scripted answer for one submit call; unscripted calls behave like a healthy server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Normal,
    Transient,
    Permanent,
    /// Applies the write but the acknowledgement never arrives.
    LoseAck,
    Unauthorized,
}

#[derive(Default)]
struct RemoteState {
    applied: Vec<MutationId>,
    seen: HashSet<MutationId>,
    resources: HashMap<String, OperationKind>,
    script: VecDeque<Script>,
    submitted: Vec<MutationId>,
    tokens: Vec<String>,
}

type SubmitHook = Box<dyn Fn(&MutationEnvelope) + Send + Sync>;

/// Remote store honoring idempotency keys.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
    hook: Mutex<Option<SubmitHook>>,
}

impl FakeRemote {
    /// Runs before every submit is answered, while the drain is waiting on the network.
    pub fn on_submit(&self, hook: impl Fn(&MutationEnvelope) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn script(&self, steps: &[Script]) {
        self.state.lock().unwrap().script.extend(steps.iter().copied());
    }

    pub fn applied(&self) -> Vec<MutationId> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn submitted(&self) -> Vec<MutationId> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().tokens.clone()
    }

    /// Applies a write out of band, as if an earlier submit had reached the server.
    pub fn deliver(&self, envelope: &MutationEnvelope) {
        Self::apply(&mut self.state.lock().unwrap(), envelope);
    }

    pub fn resource_state(&self, target: &str) -> Option<OperationKind> {
        self.state.lock().unwrap().resources.get(target).copied()
    }

    fn apply(state: &mut RemoteState, envelope: &MutationEnvelope) -> bool {
        if !state.seen.insert(envelope.id) {
            return false;
        }
        state.applied.push(envelope.id);
        state
            .resources
            .insert(envelope.target_resource.clone(), envelope.operation_kind);
        true
    }
}

impl MutationSink for FakeRemote {
    fn submit(&self, envelope: &MutationEnvelope, token: &AccessToken) -> SubmitOutcome {
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(envelope);
        }
        let mut state = self.state.lock().unwrap();
        state.submitted.push(envelope.id);
        state.tokens.push(token.expose().to_string());
        match state.script.pop_front().unwrap_or(Script::Normal) {
            Script::Normal => {
                if Self::apply(&mut state, envelope) {
                    SubmitOutcome::Applied
                } else {
                    SubmitOutcome::DuplicateAck
                }
            }
            Script::Transient => SubmitOutcome::Transient {
                reason: "http status 503".to_string(),
                retry_after_ms: None,
            },
            Script::Permanent => SubmitOutcome::Permanent {
                reason: "http status 422: payload rejected".to_string(),
            },
            Script::LoseAck => {
                Self::apply(&mut state, envelope);
                SubmitOutcome::Transient {
                    reason: "transport: timed out reading response".to_string(),
                    retry_after_ms: None,
                }
            }
            Script::Unauthorized => SubmitOutcome::Unauthorized {
                reason: "http status 401".to_string(),
            },
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub probe: Arc<SwitchProbe>,
    pub remote: Arc<FakeRemote>,
    pub remote_login: Arc<FakeLoginTier>,
    pub local_login: Arc<FakeLoginTier>,
    pub runtime: FieldSyncRuntime,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(SwitchProbe::default());
        let remote = Arc::new(FakeRemote::default());
        let remote_login = Arc::new(FakeLoginTier::new(SourceTier::Remote));
        let local_login = Arc::new(FakeLoginTier::new(SourceTier::LocalNetwork));
        let runtime = build_runtime(&dir, &probe, &remote, &remote_login, &local_login);
        Self {
            dir,
            probe,
            remote,
            remote_login,
            local_login,
            runtime,
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.dir.path().join("fieldsync.db")
    }

    /// Drops the runtime and opens a fresh one over the same files, as after a process restart.
    pub fn restart(self) -> Self {
        let Harness {
            dir,
            probe,
            remote,
            remote_login,
            local_login,
            runtime,
        } = self;
        drop(runtime);
        let runtime = build_runtime(&dir, &probe, &remote, &remote_login, &local_login);
        Self {
            dir,
            probe,
            remote,
            remote_login,
            local_login,
            runtime,
        }
    }

    pub fn all_logins_reachable(&self, up: bool) {
        self.remote_login.set_reachable(up);
        self.local_login.set_reachable(up);
    }

    pub fn login_online(&self, email: &str, password: &str) {
        self.remote_login
            .register(email, password, grant("u-1", "Ada", "tok-1"));
        self.runtime.login(email, password, NOW).unwrap();
    }
}

fn build_runtime(
    dir: &TempDir,
    probe: &Arc<SwitchProbe>,
    remote: &Arc<FakeRemote>,
    remote_login: &Arc<FakeLoginTier>,
    local_login: &Arc<FakeLoginTier>,
) -> FieldSyncRuntime {
    let store = LocalStore::open(dir.path().join("fieldsync.db")).unwrap();
    let probe: Arc<dyn BackendProbe> = probe.clone();
    let sink: Arc<dyn MutationSink> = remote.clone();
    let components = RuntimeComponents {
        remote: BackendEndpoint::new(SourceTier::Remote, "http://remote.test"),
        probe,
        sink,
        online_tiers: vec![
            Box::new(TierHandle(remote_login.clone())),
            Box::new(TierHandle(local_login.clone())),
        ],
        hasher: CredentialHasher::new(DIGEST_MIN_ITERATIONS).unwrap(),
        backoff: BackoffPolicy {
            base_ms: 1_000,
            ceiling_ms: 60_000,
        },
        expiry_margin_ms: 60_000,
    };
    FieldSyncRuntime::assemble(store, dir.path().join("vault.master.key"), components)
}
