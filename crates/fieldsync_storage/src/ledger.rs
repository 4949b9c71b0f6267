#![forbid(unsafe_code)]

use fieldsync_contracts::{
    MutationId, MutationRecord, MutationStatus, OperationKind, TargetResource, UnixMs,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use crate::db::{lock, sql_ms, SharedConnection};
use crate::error::StorageError;

pub const LAST_ERROR_MAX_CHARS: usize = 256;

const RECORD_COLUMNS: &str = "seq, mutation_id, created_at_ms, target_resource, operation_kind, \
     payload, attempt_count, last_attempt_at_ms, last_error, status, next_attempt_at_ms";

/// How a failed submission is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Leave the record PENDING; it may not be retried before `retry_not_before`.
    Transient { retry_not_before: UnixMs },
    /// Park the record as FAILED_PERMANENT for operator attention.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedgerCounts {
    pub pending: u32,
    pub in_flight: u32,
    pub applied: u32,
    pub failed_permanent: u32,
}

impl LedgerCounts {
    /// Records a drain still has to deliver.
    pub fn outstanding(&self) -> u32 {
        self.pending.saturating_add(self.in_flight)
    }
}

/// Durable append-only queue of writes waiting for the remote store.
///
/// Records are ordered by a never-reused sequence number. Appends commit before returning,
/// and no operation reorders or rewrites history: terminal records are only ever removed by
/// `compact_applied`, `discard` or `purge_failed`.
#[derive(Debug, Clone)]
pub struct MutationLedger {
    conn: SharedConnection,
}

impl MutationLedger {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub fn append(
        &self,
        now: UnixMs,
        target_resource: TargetResource,
        operation_kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<MutationRecord, StorageError> {
        let id = MutationId::generate();
        let payload_text = serde_json::to_string(&payload)?;
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO mutation_ledger
                (mutation_id, created_at_ms, target_resource, operation_kind, payload,
                 attempt_count, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                id.to_string(),
                sql_ms(now),
                target_resource.as_str(),
                operation_kind.as_str(),
                payload_text,
                MutationStatus::Pending.as_str(),
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;
        debug!(
            mutation_id = %id,
            sequence = seq,
            target = target_resource.as_str(),
            kind = operation_kind.as_str(),
            "mutation appended"
        );
        Ok(MutationRecord {
            id,
            sequence: seq as u64,
            created_at: now,
            target_resource,
            operation_kind,
            payload,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            status: MutationStatus::Pending,
            next_attempt_at: None,
        })
    }

    /// PENDING and IN_FLIGHT records in strict creation order.
    pub fn list_pending(&self) -> Result<Vec<MutationRecord>, StorageError> {
        let conn = lock(&self.conn)?;
        query_records(
            &conn,
            "WHERE status IN ('PENDING', 'IN_FLIGHT') ORDER BY seq ASC",
        )
    }

    pub fn list_failed(&self) -> Result<Vec<MutationRecord>, StorageError> {
        let conn = lock(&self.conn)?;
        query_records(&conn, "WHERE status = 'FAILED_PERMANENT' ORDER BY seq ASC")
    }

    pub fn get(&self, id: MutationId) -> Result<Option<MutationRecord>, StorageError> {
        let conn = lock(&self.conn)?;
        get_record(&conn, id)
    }

    pub fn mark_in_flight(&self, id: MutationId, now: UnixMs) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            "UPDATE mutation_ledger
             SET status = 'IN_FLIGHT', last_attempt_at_ms = ?2
             WHERE mutation_id = ?1 AND status IN ('PENDING', 'IN_FLIGHT')",
            params![id.to_string(), sql_ms(now)],
        )?;
        ensure_changed(&conn, id, changed, "PENDING or IN_FLIGHT")
    }

    /// Marks a record delivered. Re-acknowledging an APPLIED record is a no-op.
    pub fn mark_applied(&self, id: MutationId) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            "UPDATE mutation_ledger
             SET status = 'APPLIED', last_error = NULL, next_attempt_at_ms = NULL
             WHERE mutation_id = ?1 AND status IN ('PENDING', 'IN_FLIGHT', 'APPLIED')",
            params![id.to_string()],
        )?;
        ensure_changed(&conn, id, changed, "PENDING, IN_FLIGHT or APPLIED")
    }

    pub fn mark_failed(
        &self,
        id: MutationId,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<(), StorageError> {
        let error = bounded_error(error);
        let conn = lock(&self.conn)?;
        let changed = match disposition {
            FailureDisposition::Transient { retry_not_before } => conn.execute(
                "UPDATE mutation_ledger
                 SET status = 'PENDING', attempt_count = attempt_count + 1,
                     last_error = ?2, next_attempt_at_ms = ?3
                 WHERE mutation_id = ?1 AND status IN ('PENDING', 'IN_FLIGHT')",
                params![id.to_string(), error, sql_ms(retry_not_before)],
            )?,
            FailureDisposition::Permanent => conn.execute(
                "UPDATE mutation_ledger
                 SET status = 'FAILED_PERMANENT', attempt_count = attempt_count + 1,
                     last_error = ?2, next_attempt_at_ms = NULL
                 WHERE mutation_id = ?1 AND status IN ('PENDING', 'IN_FLIGHT')",
                params![id.to_string(), error],
            )?,
        };
        ensure_changed(&conn, id, changed, "PENDING or IN_FLIGHT")
    }

    /// Returns an IN_FLIGHT record to PENDING without counting an attempt.
    pub fn release(&self, id: MutationId) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            "UPDATE mutation_ledger SET status = 'PENDING'
             WHERE mutation_id = ?1 AND status IN ('PENDING', 'IN_FLIGHT')",
            params![id.to_string()],
        )?;
        ensure_changed(&conn, id, changed, "PENDING or IN_FLIGHT")
    }

    pub fn recover_in_flight(&self) -> Result<usize, StorageError> {
        let conn = lock(&self.conn)?;
        recover_in_flight_rows(&conn)
    }

    pub fn counts(&self) -> Result<LedgerCounts, StorageError> {
        let conn = lock(&self.conn)?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM mutation_ledger GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = LedgerCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = u32::try_from(count).unwrap_or(u32::MAX);
            match MutationStatus::parse(&status) {
                Some(MutationStatus::Pending) => out.pending = count,
                Some(MutationStatus::InFlight) => out.in_flight = count,
                Some(MutationStatus::Applied) => out.applied = count,
                Some(MutationStatus::FailedPermanent) => out.failed_permanent = count,
                None => {
                    return Err(StorageError::CorruptRow {
                        table: "mutation_ledger",
                        reason: format!("unknown status '{status}'"),
                    })
                }
            }
        }
        Ok(out)
    }

    pub fn pending_count(&self) -> Result<u32, StorageError> {
        Ok(self.counts()?.outstanding())
    }

    /// Operator discard of a FAILED_PERMANENT record.
    pub fn discard(&self, id: MutationId) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            "DELETE FROM mutation_ledger WHERE mutation_id = ?1 AND status = 'FAILED_PERMANENT'",
            params![id.to_string()],
        )?;
        ensure_changed(&conn, id, changed, "FAILED_PERMANENT")?;
        info!(mutation_id = %id, "failed mutation discarded by operator");
        Ok(())
    }

    pub fn purge_failed(&self) -> Result<usize, StorageError> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute(
            "DELETE FROM mutation_ledger WHERE status = 'FAILED_PERMANENT'",
            [],
        )?;
        if removed > 0 {
            info!(removed, "failed mutations purged by operator");
        }
        Ok(removed)
    }

    /// Drops APPLIED records. Sequence numbers are never reused afterwards.
    pub fn compact_applied(&self) -> Result<usize, StorageError> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute("DELETE FROM mutation_ledger WHERE status = 'APPLIED'", [])?;
        debug!(removed, "applied mutations compacted");
        Ok(removed)
    }
}

pub(crate) fn recover_in_flight_rows(conn: &Connection) -> Result<usize, StorageError> {
    let recovered = conn.execute(
        "UPDATE mutation_ledger SET status = 'PENDING' WHERE status = 'IN_FLIGHT'",
        [],
    )?;
    if recovered > 0 {
        info!(recovered, "in-flight mutations from a previous run reset to pending");
    }
    Ok(recovered)
}

fn bounded_error(error: &str) -> String {
    if error.chars().count() > LAST_ERROR_MAX_CHARS {
        error.chars().take(LAST_ERROR_MAX_CHARS).collect()
    } else {
        error.to_string()
    }
}

fn ensure_changed(
    conn: &Connection,
    id: MutationId,
    changed: usize,
    required: &'static str,
) -> Result<(), StorageError> {
    if changed > 0 {
        return Ok(());
    }
    match get_record(conn, id)? {
        None => Err(StorageError::MutationNotFound(id)),
        Some(record) => Err(StorageError::InvalidTransition {
            id,
            status: record.status,
            required,
        }),
    }
}

fn get_record(conn: &Connection, id: MutationId) -> Result<Option<MutationRecord>, StorageError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM mutation_ledger WHERE mutation_id = ?1");
    let raw = conn
        .query_row(&sql, params![id.to_string()], RawRecord::read)
        .optional()?;
    raw.map(RawRecord::into_record).transpose()
}

fn query_records(conn: &Connection, clause: &str) -> Result<Vec<MutationRecord>, StorageError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM mutation_ledger {clause}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], RawRecord::read)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_record()?);
    }
    Ok(out)
}

struct RawRecord {
    seq: i64,
    mutation_id: String,
    created_at_ms: i64,
    target_resource: String,
    operation_kind: String,
    payload: String,
    attempt_count: i64,
    last_attempt_at_ms: Option<i64>,
    last_error: Option<String>,
    status: String,
    next_attempt_at_ms: Option<i64>,
}

impl RawRecord {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            mutation_id: row.get(1)?,
            created_at_ms: row.get(2)?,
            target_resource: row.get(3)?,
            operation_kind: row.get(4)?,
            payload: row.get(5)?,
            attempt_count: row.get(6)?,
            last_attempt_at_ms: row.get(7)?,
            last_error: row.get(8)?,
            status: row.get(9)?,
            next_attempt_at_ms: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<MutationRecord, StorageError> {
        let corrupt = |reason: String| StorageError::CorruptRow {
            table: "mutation_ledger",
            reason,
        };
        let operation_kind = OperationKind::parse(&self.operation_kind)
            .ok_or_else(|| corrupt(format!("unknown operation kind '{}'", self.operation_kind)))?;
        let status = MutationStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        Ok(MutationRecord {
            id: MutationId::parse(&self.mutation_id)?,
            sequence: self.seq.max(0) as u64,
            created_at: UnixMs(self.created_at_ms.max(0) as u64),
            target_resource: TargetResource::new(self.target_resource)?,
            operation_kind,
            payload: serde_json::from_str(&self.payload)?,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(u32::MAX),
            last_attempt_at: self.last_attempt_at_ms.map(|ms| UnixMs(ms.max(0) as u64)),
            last_error: self.last_error,
            status,
            next_attempt_at: self.next_attempt_at_ms.map(|ms| UnixMs(ms.max(0) as u64)),
        })
    }
}
