#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};

use fieldsync_contracts::{SyncHalt, SyncReport, UnixMs};
use fieldsync_engines::{
    BackendEndpoint, BackendProbe, MutationEnvelope, MutationSink, Reachability, SubmitOutcome,
};
use fieldsync_storage::{FailureDisposition, MutationLedger, StorageError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session_manager::SessionManager;

pub const BACKOFF_BASE_MS_DEFAULT: u64 = 2_000;
pub const BACKOFF_CEILING_MS_DEFAULT: u64 = 5 * 60 * 1_000;

/// Exponential retry delay for transient submit failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub ceiling_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: BACKOFF_BASE_MS_DEFAULT,
            ceiling_ms: BACKOFF_CEILING_MS_DEFAULT,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^(attempt-1), ceiling)`; a server hint may lengthen it but not past the ceiling.
    pub fn delay_ms(&self, attempt: u32, retry_after_ms: Option<u64>) -> u64 {
        let exp = attempt.saturating_sub(1).min(63);
        let computed = self
            .base_ms
            .checked_mul(1u64 << exp)
            .unwrap_or(u64::MAX)
            .min(self.ceiling_ms);
        computed
            .max(retry_after_ms.unwrap_or(0))
            .min(self.ceiling_ms)
    }
}

/// Replays the mutation ledger against the remote store, oldest first.
pub struct SyncOrchestrator {
    ledger: MutationLedger,
    remote: BackendEndpoint,
    probe: Arc<dyn BackendProbe>,
    sink: Arc<dyn MutationSink>,
    sessions: Arc<SessionManager>,
    backoff: BackoffPolicy,
    drain_lock: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        ledger: MutationLedger,
        remote: BackendEndpoint,
        probe: Arc<dyn BackendProbe>,
        sink: Arc<dyn MutationSink>,
        sessions: Arc<SessionManager>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            ledger,
            remote,
            probe,
            sink,
            sessions,
            backoff,
            drain_lock: Mutex::new(()),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// One pass over the pending queue. Concurrent callers wait for the running pass.
    ///
    /// Halts before touching the ledger when there is no usable session or the remote
    /// is unreachable. Inside the pass a transient failure, a token rejection or a record
    /// still backing off stops it; a permanent failure parks the record and moves on.
    /// Cancellation is observed between records only.
    pub fn drain(&self, now: UnixMs, cancel: &CancellationToken) -> Result<SyncReport, StorageError> {
        let _guard = self.drain_lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.sessions.check_expiry(now);
        let Some(session) = self.sessions.current() else {
            return self.halt(SyncHalt::NoSession);
        };
        if session.is_expired(now) {
            return self.halt(SyncHalt::SessionExpired);
        }
        if let Reachability::Unreachable(reason) = self.probe.probe(&self.remote) {
            debug!(%reason, "remote unreachable; drain skipped");
            return self.halt(SyncHalt::RemoteUnreachable);
        }

        let mut report = SyncReport::default();
        for record in self.ledger.list_pending()? {
            if cancel.is_cancelled() {
                report.halt = Some(SyncHalt::Cancelled);
                break;
            }
            if !record.is_due(now) {
                report.halt = Some(SyncHalt::BackoffPending);
                break;
            }
            self.ledger.mark_in_flight(record.id, now)?;
            let envelope = MutationEnvelope::from_record(&record);
            match self.sink.submit(&envelope, &session.token) {
                SubmitOutcome::Applied | SubmitOutcome::DuplicateAck => {
                    self.ledger.mark_applied(record.id)?;
                    report.applied_count = report.applied_count.saturating_add(1);
                }
                SubmitOutcome::Permanent { reason } => {
                    warn!(mutation_id = %record.id, sequence = record.sequence, %reason, "mutation failed permanently");
                    self.ledger
                        .mark_failed(record.id, &reason, FailureDisposition::Permanent)?;
                    report.failed_count = report.failed_count.saturating_add(1);
                }
                SubmitOutcome::Transient {
                    reason,
                    retry_after_ms,
                } => {
                    let attempt = record.attempt_count.saturating_add(1);
                    let delay_ms = self.backoff.delay_ms(attempt, retry_after_ms);
                    warn!(mutation_id = %record.id, attempt, delay_ms, %reason, "transient sync failure; pass stopped");
                    self.ledger.mark_failed(
                        record.id,
                        &reason,
                        FailureDisposition::Transient {
                            retry_not_before: now.saturating_add_ms(delay_ms),
                        },
                    )?;
                    report.halt = Some(SyncHalt::TransientFailure);
                    break;
                }
                SubmitOutcome::Unauthorized { reason } => {
                    warn!(mutation_id = %record.id, %reason, "remote rejected session token");
                    self.ledger.release(record.id)?;
                    report.halt = Some(SyncHalt::TokenRejected);
                    break;
                }
            }
        }
        report.remaining_count = self.ledger.pending_count()?;
        info!(
            applied = report.applied_count,
            failed = report.failed_count,
            remaining = report.remaining_count,
            halt = ?report.halt,
            "drain finished"
        );
        Ok(report)
    }

    fn halt(&self, halt: SyncHalt) -> Result<SyncReport, StorageError> {
        let remaining = self.ledger.pending_count()?;
        debug!(?halt, remaining, "drain halted before start");
        Ok(SyncReport::halted(halt, remaining))
    }
}
