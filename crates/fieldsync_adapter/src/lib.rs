#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};

use fieldsync_contracts::{
    MutationId, MutationRecord, OperationKind, SourceTier, SyncReport, UnixMs,
};
use fieldsync_os::{
    AuthError, ConnectivityChange, ConnectivityWatch, FieldSyncConfig, FieldSyncRuntime,
    RuntimeError, RuntimeStatus, SessionSummary,
};
use fieldsync_storage::{LedgerCounts, StorageError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct LoginAdapterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub source_tier: SourceTier,
    pub session: SessionSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MutationAdapterRequest {
    pub target_resource: String,
    pub operation_kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogoutAdapterQuery {
    #[serde(default)]
    pub wipe: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub mutation_id: MutationId,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub report: SyncReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedMutationRow {
    pub mutation_id: MutationId,
    pub sequence: u64,
    pub target_resource: String,
    pub operation_kind: OperationKind,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl FailedMutationRow {
    fn from_record(record: &MutationRecord) -> Self {
        Self {
            mutation_id: record.id,
            sequence: record.sequence,
            target_resource: record.target_resource.as_str().to_string(),
            operation_kind: record.operation_kind,
            attempt_count: record.attempt_count,
            last_error: record.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedMutationsResponse {
    pub status: String,
    pub records: Vec<FailedMutationRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterAckResponse {
    pub status: String,
    pub outcome: String,
    pub removed: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatusResponse {
    pub status: String,
    #[serde(flatten)]
    pub runtime: RuntimeStatus,
    pub remote_online: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub ledger: LedgerCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterErrorResponse {
    pub status: String,
    pub outcome: String,
    pub reason: String,
    pub source_tier: Option<SourceTier>,
}

/// Maps a runtime failure onto an HTTP status code and a body naming the tier that answered.
pub fn error_response(err: &RuntimeError) -> (u16, AdapterErrorResponse) {
    let (code, outcome, tier) = match err {
        RuntimeError::Auth(auth) => match auth {
            AuthError::CredentialRejected { .. } => (401, "CREDENTIAL_REJECTED", auth.tier()),
            AuthError::RequestRejected { .. } => (400, "REQUEST_REJECTED", auth.tier()),
            AuthError::VaultMiss => (401, "VAULT_MISS", auth.tier()),
            AuthError::Unreachable(_) => (503, "UNREACHABLE", None),
            AuthError::InvalidInput(_) => (400, "INVALID_INPUT", None),
        },
        RuntimeError::NotAuthenticated => (401, "NOT_AUTHENTICATED", None),
        RuntimeError::Contract(_) => (400, "INVALID_INPUT", None),
        RuntimeError::Storage(StorageError::MutationNotFound(_)) => (404, "NOT_FOUND", None),
        RuntimeError::Storage(StorageError::InvalidTransition { .. }) => {
            (409, "INVALID_TRANSITION", None)
        }
        RuntimeError::Storage(_) | RuntimeError::Config(_) | RuntimeError::Digest(_) => {
            (500, "INTERNAL", None)
        }
    };
    (
        code,
        AdapterErrorResponse {
            status: "error".to_string(),
            outcome: outcome.to_string(),
            reason: err.to_string(),
            source_tier: tier,
        },
    )
}

pub fn invalid_input(reason: impl Into<String>) -> (u16, AdapterErrorResponse) {
    (
        400,
        AdapterErrorResponse {
            status: "error".to_string(),
            outcome: "INVALID_INPUT".to_string(),
            reason: reason.into(),
            source_tier: None,
        },
    )
}

/// Operator surface over one runtime. Every method blocks; async callers move it off the reactor.
pub struct AdapterRuntime {
    runtime: Arc<FieldSyncRuntime>,
    watch: Mutex<ConnectivityWatch>,
    cancel: CancellationToken,
}

impl AdapterRuntime {
    pub fn new(runtime: FieldSyncRuntime, cancel: CancellationToken) -> Self {
        Self {
            runtime: Arc::new(runtime),
            watch: Mutex::new(ConnectivityWatch::new()),
            cancel,
        }
    }

    pub fn from_env(cancel: CancellationToken) -> Result<Self, RuntimeError> {
        let config = FieldSyncConfig::from_env()?;
        Ok(Self::new(FieldSyncRuntime::open(&config)?, cancel))
    }

    pub fn runtime(&self) -> &FieldSyncRuntime {
        &self.runtime
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        match self.runtime.status() {
            Ok(status) => AdapterHealthResponse {
                status: "ok".to_string(),
                outcome: "HEALTHY".to_string(),
                reason: None,
                ledger: status.ledger,
            },
            Err(err) => AdapterHealthResponse {
                status: "error".to_string(),
                outcome: "UNHEALTHY".to_string(),
                reason: Some(err.to_string()),
                ledger: LedgerCounts::default(),
            },
        }
    }

    pub fn status(&self) -> Result<AdapterStatusResponse, RuntimeError> {
        Ok(AdapterStatusResponse {
            status: "ok".to_string(),
            runtime: self.runtime.status()?,
            remote_online: self.watch().is_online(),
        })
    }

    pub fn login(&self, request: LoginAdapterRequest) -> Result<LoginAdapterResponse, RuntimeError> {
        let session = self
            .runtime
            .login(&request.email, &request.password, UnixMs::now())?;
        let outcome = if session.is_degraded() {
            "AUTHENTICATED_OFFLINE"
        } else {
            "AUTHENTICATED"
        };
        Ok(LoginAdapterResponse {
            status: "ok".to_string(),
            outcome: outcome.to_string(),
            source_tier: session.source_tier,
            session: SessionSummary::from_session(&session),
        })
    }

    /// `wipe` also drops the user's cached credentials, so the next offline login misses.
    pub fn logout(&self, wipe: bool) -> Result<AdapterAckResponse, RuntimeError> {
        let ended = if wipe {
            self.runtime.logout_and_wipe()?
        } else {
            self.runtime.logout()
        };
        let outcome = match (ended.is_some(), wipe) {
            (false, _) => "NO_SESSION",
            (true, false) => "LOGGED_OUT",
            (true, true) => "LOGGED_OUT_AND_WIPED",
        };
        Ok(AdapterAckResponse {
            status: "ok".to_string(),
            outcome: outcome.to_string(),
            removed: None,
        })
    }

    /// Writes always land in the ledger first; the response says so.
    pub fn record_mutation(
        &self,
        request: MutationAdapterRequest,
    ) -> Result<MutationAdapterResponse, (u16, AdapterErrorResponse)> {
        let kind = OperationKind::parse(&request.operation_kind)
            .ok_or_else(|| invalid_input("operation_kind must be CREATE, UPDATE or DELETE"))?;
        let record = self
            .runtime
            .record_mutation(
                UnixMs::now(),
                &request.target_resource,
                kind,
                request.payload,
            )
            .map_err(|e| error_response(&e))?;
        Ok(MutationAdapterResponse {
            status: "ok".to_string(),
            outcome: "QUEUED_FOR_LATER".to_string(),
            mutation_id: record.id,
            sequence: record.sequence,
        })
    }

    pub fn sync_now(&self, now: Option<UnixMs>) -> Result<SyncAdapterResponse, RuntimeError> {
        let report = self
            .runtime
            .drain(now.unwrap_or_else(UnixMs::now), &self.cancel)?;
        Ok(sync_response(report))
    }

    pub fn failed_mutations(&self) -> Result<FailedMutationsResponse, RuntimeError> {
        let records = self.runtime.failed_mutations()?;
        Ok(FailedMutationsResponse {
            status: "ok".to_string(),
            records: records.iter().map(FailedMutationRow::from_record).collect(),
        })
    }

    pub fn discard_failed(&self, raw_id: &str) -> Result<AdapterAckResponse, (u16, AdapterErrorResponse)> {
        let id = MutationId::parse(raw_id).map_err(|e| invalid_input(e.to_string()))?;
        self.runtime
            .discard_failed(id)
            .map_err(|e| error_response(&e))?;
        Ok(AdapterAckResponse {
            status: "ok".to_string(),
            outcome: "DISCARDED".to_string(),
            removed: Some(1),
        })
    }

    pub fn purge_failed(&self) -> Result<AdapterAckResponse, RuntimeError> {
        let removed = self.runtime.purge_failed()?;
        Ok(AdapterAckResponse {
            status: "ok".to_string(),
            outcome: "PURGED".to_string(),
            removed: Some(removed),
        })
    }

    /// One background tick: probe the remote and drain when it just came back or work is waiting.
    pub fn run_sync_worker_tick(&self, now: Option<UnixMs>) -> Result<Option<SyncReport>, RuntimeError> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let reachability = self.runtime.probe_remote();
        let change = self.watch().observe(&reachability);
        if !reachability.is_reachable() {
            return Ok(None);
        }
        if change == ConnectivityChange::Restored {
            info!("remote reachable again; draining ledger");
        } else if self.runtime.status()?.ledger.outstanding() == 0 {
            return Ok(None);
        }
        let report = self
            .runtime
            .drain(now.unwrap_or_else(UnixMs::now), &self.cancel)?;
        if report.applied_count > 0 {
            let compacted = self.runtime.compact()?;
            tracing::debug!(compacted, "applied mutations compacted after drain");
        }
        Ok(Some(report))
    }

    fn watch(&self) -> std::sync::MutexGuard<'_, ConnectivityWatch> {
        self.watch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sync_response(report: SyncReport) -> SyncAdapterResponse {
    let outcome = match report.halt {
        None if report.remaining_count == 0 => "SYNCED".to_string(),
        None => "PARTIAL".to_string(),
        Some(halt) => serde_json::to_value(halt)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "HALTED".to_string()),
    };
    SyncAdapterResponse {
        status: "ok".to_string(),
        outcome,
        report,
    }
}
