#![forbid(unsafe_code)]

use fieldsync_engines::Reachability;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityChange {
    Unchanged,
    Restored,
    Lost,
}

/// Tracks the last observed remote reachability. The first observation is a baseline.
#[derive(Debug, Default)]
pub struct ConnectivityWatch {
    last: Option<bool>,
}

impl ConnectivityWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> Option<bool> {
        self.last
    }

    pub fn observe(&mut self, reachability: &Reachability) -> ConnectivityChange {
        let now_up = reachability.is_reachable();
        let change = match (self.last, now_up) {
            (Some(false), true) => ConnectivityChange::Restored,
            (Some(true), false) => ConnectivityChange::Lost,
            _ => ConnectivityChange::Unchanged,
        };
        self.last = Some(now_up);
        if change != ConnectivityChange::Unchanged {
            info!(?change, "remote connectivity changed");
        }
        change
    }
}
