#![forbid(unsafe_code)]

use tracing::debug;

use crate::http::{bounded_message, BackendEndpoint, HttpTimeouts};

pub const HEALTH_PATH: &str = "/v1/health";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable(String),
}

impl Reachability {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable)
    }
}

/// Decides whether a backend is answering. Implementations never fail past this boundary.
pub trait BackendProbe: Send + Sync {
    fn probe(&self, endpoint: &BackendEndpoint) -> Reachability;
}

#[derive(Debug, Clone, Copy)]
pub struct HttpBackendProbe {
    timeouts: HttpTimeouts,
}

impl Default for HttpBackendProbe {
    fn default() -> Self {
        Self::new(HttpTimeouts::probe_default())
    }
}

impl HttpBackendProbe {
    pub fn new(timeouts: HttpTimeouts) -> Self {
        Self { timeouts }
    }
}

impl BackendProbe for HttpBackendProbe {
    fn probe(&self, endpoint: &BackendEndpoint) -> Reachability {
        let url = endpoint.url(HEALTH_PATH);
        let outcome = match self.timeouts.agent().get(&url).call() {
            Ok(resp) => classify_probe_status(resp.status()),
            Err(ureq::Error::Status(code, _)) => classify_probe_status(code),
            Err(ureq::Error::Transport(err)) => {
                Reachability::Unreachable(bounded_message(format!("transport: {err}")))
            }
        };
        debug!(tier = %endpoint.tier, reachable = outcome.is_reachable(), "backend probed");
        outcome
    }
}

/// Any answer other than a server-side failure counts as reachable: a 4xx means the backend
/// is up and disagreed with the request, which must not trigger a failover.
pub fn classify_probe_status(status: u16) -> Reachability {
    if status >= 500 {
        Reachability::Unreachable(format!("http status {status}"))
    } else {
        Reachability::Reachable
    }
}
