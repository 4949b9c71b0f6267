#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fieldsync_contracts::{Session, SourceTier, UnixMs};
use tracing::{debug, info};

pub const EXPIRY_MARGIN_MS_DEFAULT: u64 = 60_000;

pub type ExpiryCallback = Arc<dyn Fn(&Session) + Send + Sync>;

#[derive(Default)]
struct Slot {
    session: Option<Session>,
    expiry_notified: bool,
}

/// Holds the single authoritative session for this device.
///
/// Expiry callbacks fire at most once per session: `set` re-arms them.
pub struct SessionManager {
    slot: Mutex<Slot>,
    callbacks: Mutex<Vec<ExpiryCallback>>,
    margin_ms: u64,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(EXPIRY_MARGIN_MS_DEFAULT)
    }
}

impl SessionManager {
    pub fn new(margin_ms: u64) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            callbacks: Mutex::new(Vec::new()),
            margin_ms,
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.slot().session.clone()
    }

    pub fn current_tier(&self) -> Option<SourceTier> {
        self.slot().session.as_ref().map(|s| s.source_tier)
    }

    pub fn set(&self, session: Session) {
        info!(
            user_id = session.user_id.as_str(),
            tier = %session.source_tier,
            expires_at_ms = session.token_expires_at.0,
            "session established"
        );
        let mut slot = self.slot();
        slot.session = Some(session);
        slot.expiry_notified = false;
    }

    pub fn clear(&self) -> Option<Session> {
        let mut slot = self.slot();
        slot.expiry_notified = false;
        let previous = slot.session.take();
        if let Some(s) = &previous {
            info!(user_id = s.user_id.as_str(), "session cleared");
        }
        previous
    }

    pub fn on_expiring<F>(&self, callback: F)
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Fires expiry callbacks if the current token is within the margin. Returns whether they fired.
    pub fn check_expiry(&self, now: UnixMs) -> bool {
        let session = {
            let mut slot = self.slot();
            let due = match &slot.session {
                Some(s) => !slot.expiry_notified && s.expires_within(now, self.margin_ms),
                None => false,
            };
            if !due {
                return false;
            }
            slot.expiry_notified = true;
            slot.session.clone()
        };
        let Some(session) = session else {
            return false;
        };
        let callbacks: Vec<ExpiryCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        debug!(
            user_id = session.user_id.as_str(),
            callbacks = callbacks.len(),
            "session expiring"
        );
        for cb in callbacks {
            cb(&session);
        }
        true
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
