#![forbid(unsafe_code)]

use std::time::Duration;

use fieldsync_contracts::SourceTier;

pub const CONNECT_TIMEOUT_MS_DEFAULT: u64 = 2_000;
pub const PROBE_READ_TIMEOUT_MS_DEFAULT: u64 = 3_000;
pub const REQUEST_TIMEOUT_MS_DEFAULT: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub connect_ms: u64,
    pub read_ms: u64,
}

impl HttpTimeouts {
    pub fn probe_default() -> Self {
        Self {
            connect_ms: CONNECT_TIMEOUT_MS_DEFAULT,
            read_ms: PROBE_READ_TIMEOUT_MS_DEFAULT,
        }
    }

    pub fn request_default() -> Self {
        Self {
            connect_ms: CONNECT_TIMEOUT_MS_DEFAULT,
            read_ms: REQUEST_TIMEOUT_MS_DEFAULT,
        }
    }

    /// Deadline for one whole call, from connect to the last byte of the response head.
    pub fn budget_ms(&self) -> u64 {
        self.connect_ms
            .saturating_add(self.read_ms.saturating_mul(2))
    }

    pub(crate) fn agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.budget_ms()))
            .timeout_connect(Duration::from_millis(self.connect_ms))
            .timeout_read(Duration::from_millis(self.read_ms))
            .timeout_write(Duration::from_millis(self.read_ms))
            .build()
    }
}

/// One candidate backend: which tier it serves and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub tier: SourceTier,
    pub base_url: String,
}

impl BackendEndpoint {
    pub fn new(tier: SourceTier, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        Self { tier, base_url }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

pub(crate) fn bounded_message(raw: impl Into<String>) -> String {
    let msg = raw.into();
    if msg.chars().count() > 256 {
        msg.chars().take(256).collect()
    } else {
        msg
    }
}

/// Parses a `Retry-After` header given in whole seconds.
pub(crate) fn parse_retry_after_ms(header: Option<&str>) -> Option<u64> {
    header?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|s| s.saturating_mul(1_000))
}
