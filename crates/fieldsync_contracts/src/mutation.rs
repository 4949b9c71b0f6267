#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{validate_id, ContractViolation, UnixMs, Validate};

/// Client-generated mutation id. Doubles as the idempotency key sent to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(Uuid);

impl MutationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| ContractViolation::InvalidValue {
                field: "mutation_id",
                reason: "must be a uuid",
            })
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for MutationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Remote resource a mutation targets, e.g. `assets/A-1001`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetResource(String);

impl TargetResource {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(raw.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for TargetResource {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("target_resource", &self.0, 512)
    }
}

impl TryFrom<String> for TargetResource {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TargetResource> for String {
    fn from(value: TargetResource) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Applied,
    FailedPermanent,
}

impl MutationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InFlight => "IN_FLIGHT",
            Self::Applied => "APPLIED",
            Self::FailedPermanent => "FAILED_PERMANENT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "IN_FLIGHT" => Some(Self::InFlight),
            "APPLIED" => Some(Self::Applied),
            "FAILED_PERMANENT" => Some(Self::FailedPermanent),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::FailedPermanent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: MutationId,
    pub sequence: u64,
    pub created_at: UnixMs,
    pub target_resource: TargetResource,
    pub operation_kind: OperationKind,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub last_attempt_at: Option<UnixMs>,
    pub last_error: Option<String>,
    pub status: MutationStatus,
    pub next_attempt_at: Option<UnixMs>,
}

impl MutationRecord {
    pub fn idempotency_key(&self) -> String {
        self.id.to_string()
    }

    pub fn is_due(&self, now: UnixMs) -> bool {
        self.next_attempt_at.map(|at| now >= at).unwrap_or(true)
    }
}

/// Why a drain pass stopped before reaching the end of the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncHalt {
    RemoteUnreachable,
    NoSession,
    SessionExpired,
    TokenRejected,
    TransientFailure,
    BackoffPending,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub applied_count: u32,
    pub failed_count: u32,
    pub remaining_count: u32,
    pub halt: Option<SyncHalt>,
}

impl SyncReport {
    pub fn halted(halt: SyncHalt, remaining_count: u32) -> Self {
        Self {
            remaining_count,
            halt: Some(halt),
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.halt.is_none() && self.remaining_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_mutation_01_ids_are_unique_and_round_trip_text() {
        let a = MutationId::generate();
        let b = MutationId::generate();
        assert_ne!(a, b);
        assert_eq!(MutationId::parse(&a.to_string()).unwrap(), a);
        assert!(MutationId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn at_mutation_02_status_labels_parse_back() {
        for status in [
            MutationStatus::Pending,
            MutationStatus::InFlight,
            MutationStatus::Applied,
            MutationStatus::FailedPermanent,
        ] {
            assert_eq!(MutationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OperationKind::parse("update"), Some(OperationKind::Update));
        assert_eq!(OperationKind::parse("upsert"), None);
    }

    #[test]
    fn at_mutation_03_due_respects_backoff_window() {
        let record = MutationRecord {
            id: MutationId::generate(),
            sequence: 1,
            created_at: UnixMs(1),
            target_resource: TargetResource::new("assets/A").unwrap(),
            operation_kind: OperationKind::Create,
            payload: serde_json::json!({"name": "pump"}),
            attempt_count: 1,
            last_attempt_at: Some(UnixMs(10)),
            last_error: Some("http 503".to_string()),
            status: MutationStatus::Pending,
            next_attempt_at: Some(UnixMs(100)),
        };
        assert!(!record.is_due(UnixMs(99)));
        assert!(record.is_due(UnixMs(100)));
    }
}
