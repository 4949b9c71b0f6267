#![forbid(unsafe_code)]

use fieldsync_contracts::{AccessToken, MutationId, MutationRecord, OperationKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{bounded_message, parse_retry_after_ms, BackendEndpoint, HttpTimeouts};

pub const SYNC_MUTATIONS_PATH: &str = "/v1/sync/mutations";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Wire form of one ledger record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationEnvelope {
    pub id: MutationId,
    pub sequence: u64,
    pub target_resource: String,
    pub operation_kind: OperationKind,
    pub payload: serde_json::Value,
    pub created_at_ms: u64,
}

impl MutationEnvelope {
    pub fn from_record(record: &MutationRecord) -> Self {
        Self {
            id: record.id,
            sequence: record.sequence,
            target_resource: record.target_resource.as_str().to_string(),
            operation_kind: record.operation_kind,
            payload: record.payload.clone(),
            created_at_ms: record.created_at.0,
        }
    }

    pub fn idempotency_key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Applied,
    /// The remote had already applied this idempotency key.
    DuplicateAck,
    Transient {
        reason: String,
        retry_after_ms: Option<u64>,
    },
    Permanent {
        reason: String,
    },
    /// The bearer token was refused; nothing about the record itself is known.
    Unauthorized {
        reason: String,
    },
}

impl SubmitOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Applied | Self::DuplicateAck)
    }
}

/// Remote write endpoint. Implementations never fail past this boundary.
pub trait MutationSink: Send + Sync {
    fn submit(&self, envelope: &MutationEnvelope, token: &AccessToken) -> SubmitOutcome;
}

#[derive(Debug, Deserialize)]
struct SubmitAckBody {
    #[serde(default)]
    outcome: Option<String>,
}

pub struct HttpMutationSink {
    endpoint: BackendEndpoint,
    timeouts: HttpTimeouts,
}

impl HttpMutationSink {
    pub fn new(endpoint: BackendEndpoint, timeouts: HttpTimeouts) -> Self {
        Self { endpoint, timeouts }
    }
}

impl MutationSink for HttpMutationSink {
    fn submit(&self, envelope: &MutationEnvelope, token: &AccessToken) -> SubmitOutcome {
        let result = self
            .timeouts
            .agent()
            .post(&self.endpoint.url(SYNC_MUTATIONS_PATH))
            .set("authorization", &format!("Bearer {}", token.expose()))
            .set(IDEMPOTENCY_KEY_HEADER, &envelope.idempotency_key())
            .set("accept", "application/json")
            .send_json(envelope);
        let outcome = match result {
            Ok(resp) => {
                let ack = resp
                    .into_json::<SubmitAckBody>()
                    .ok()
                    .and_then(|b| b.outcome);
                match ack.as_deref() {
                    Some("duplicate") => SubmitOutcome::DuplicateAck,
                    _ => SubmitOutcome::Applied,
                }
            }
            Err(ureq::Error::Status(code, resp)) => {
                let retry_after_ms = parse_retry_after_ms(resp.header("retry-after"));
                let body = resp.into_string().unwrap_or_default();
                classify_sync_status(code, body, retry_after_ms)
            }
            Err(ureq::Error::Transport(err)) => SubmitOutcome::Transient {
                reason: bounded_message(format!("transport: {err}")),
                retry_after_ms: None,
            },
        };
        debug!(mutation_id = %envelope.id, sequence = envelope.sequence, ?outcome, "mutation submitted");
        outcome
    }
}

/// Maps a non-2xx sync answer onto retry semantics.
pub fn classify_sync_status(status: u16, body: String, retry_after_ms: Option<u64>) -> SubmitOutcome {
    let reason = if body.trim().is_empty() {
        format!("http status {status}")
    } else {
        bounded_message(format!("http status {status}: {}", body.trim()))
    };
    match status {
        401 => SubmitOutcome::Unauthorized { reason },
        408 | 425 | 429 => SubmitOutcome::Transient {
            reason,
            retry_after_ms,
        },
        s if s >= 500 => SubmitOutcome::Transient {
            reason,
            retry_after_ms,
        },
        _ => SubmitOutcome::Permanent { reason },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_contracts::{MutationStatus, TargetResource, UnixMs};
    use serde_json::json;

    fn record() -> MutationRecord {
        MutationRecord {
            id: MutationId::generate(),
            sequence: 7,
            created_at: UnixMs(1_234),
            target_resource: TargetResource::new("work_orders/42").unwrap(),
            operation_kind: OperationKind::Update,
            payload: json!({"status": "done"}),
            attempt_count: 2,
            last_attempt_at: Some(UnixMs(1_300)),
            last_error: Some("http status 503".to_string()),
            status: MutationStatus::InFlight,
            next_attempt_at: None,
        }
    }

    #[test]
    fn at_sink_01_envelope_carries_record_identity_not_local_bookkeeping() {
        let rec = record();
        let env = MutationEnvelope::from_record(&rec);
        assert_eq!(env.idempotency_key(), rec.idempotency_key());
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["sequence"], 7);
        assert_eq!(wire["target_resource"], "work_orders/42");
        assert_eq!(wire["operation_kind"], "UPDATE");
        assert_eq!(wire["created_at_ms"], 1_234);
        assert!(wire.get("attempt_count").is_none());
        assert!(wire.get("last_error").is_none());
    }

    #[test]
    fn at_sink_02_status_classification() {
        assert!(matches!(
            classify_sync_status(401, String::new(), None),
            SubmitOutcome::Unauthorized { .. }
        ));
        assert_eq!(
            classify_sync_status(429, String::new(), Some(5_000)),
            SubmitOutcome::Transient {
                reason: "http status 429".to_string(),
                retry_after_ms: Some(5_000),
            }
        );
        assert!(matches!(
            classify_sync_status(503, String::new(), None),
            SubmitOutcome::Transient { .. }
        ));
        for code in [400u16, 403, 404, 409, 410, 422] {
            assert!(
                matches!(
                    classify_sync_status(code, "nope".to_string(), None),
                    SubmitOutcome::Permanent { .. }
                ),
                "{code}"
            );
        }
    }

    #[test]
    fn at_sink_03_failure_reason_is_bounded() {
        match classify_sync_status(422, "x".repeat(1_000), None) {
            SubmitOutcome::Permanent { reason } => assert!(reason.chars().count() <= 256),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn at_sink_04_unreachable_sink_is_transient() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let sink = HttpMutationSink::new(
            BackendEndpoint::new(
                fieldsync_contracts::SourceTier::Remote,
                format!("http://127.0.0.1:{port}"),
            ),
            HttpTimeouts {
                connect_ms: 300,
                read_ms: 300,
            },
        );
        let env = MutationEnvelope::from_record(&record());
        let outcome = sink.submit(&env, &AccessToken::new("tok").unwrap());
        assert!(matches!(outcome, SubmitOutcome::Transient { .. }));
        assert!(!outcome.is_delivered());
    }
}
