#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

use fieldsync_contracts::TenantId;
use fieldsync_engines::credential_digest::{
    DIGEST_DEFAULT_ITERATIONS, DIGEST_MAX_ITERATIONS, DIGEST_MIN_ITERATIONS,
};
use fieldsync_engines::http::{
    CONNECT_TIMEOUT_MS_DEFAULT, PROBE_READ_TIMEOUT_MS_DEFAULT, REQUEST_TIMEOUT_MS_DEFAULT,
};
use fieldsync_engines::HttpTimeouts;
use tracing::warn;

use crate::session_manager::EXPIRY_MARGIN_MS_DEFAULT;
use crate::sync_orchestrator::{BackoffPolicy, BACKOFF_BASE_MS_DEFAULT, BACKOFF_CEILING_MS_DEFAULT};

pub const STORE_FILE_NAME: &str = "fieldsync.db";
pub const MASTER_KEY_FILE_NAME: &str = "vault.master.key";
pub const DATA_DIR_DEFAULT: &str = ".fieldsync";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSyncConfig {
    pub data_dir: PathBuf,
    pub remote_url: String,
    pub local_url: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub probe_timeouts: HttpTimeouts,
    pub request_timeouts: HttpTimeouts,
    pub backoff: BackoffPolicy,
    pub digest_iterations: u32,
    pub expiry_margin_ms: u64,
}

impl FieldSyncConfig {
    /// Config with defaults for everything but the remote endpoint.
    pub fn new(data_dir: impl Into<PathBuf>, remote_url: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            remote_url: remote_url.into(),
            local_url: None,
            tenant_id: None,
            probe_timeouts: HttpTimeouts::probe_default(),
            request_timeouts: HttpTimeouts::request_default(),
            backoff: BackoffPolicy::default(),
            digest_iterations: DIGEST_DEFAULT_ITERATIONS,
            expiry_margin_ms: EXPIRY_MARGIN_MS_DEFAULT,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Out-of-range numeric values fall back to their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let bounded = |key: &'static str, min: u64, max: u64, default: u64| -> u64 {
            match non_empty(key) {
                None => default,
                Some(raw) => match raw.parse::<u64>() {
                    Ok(v) if (min..=max).contains(&v) => v,
                    _ => {
                        warn!(var = key, value = %raw, default, "ignoring out-of-range setting");
                        default
                    }
                },
            }
        };

        let remote_url =
            non_empty("FIELDSYNC_REMOTE_URL").ok_or(ConfigError::Missing("FIELDSYNC_REMOTE_URL"))?;
        check_url("FIELDSYNC_REMOTE_URL", &remote_url)?;
        let local_url = non_empty("FIELDSYNC_LOCAL_URL");
        if let Some(url) = &local_url {
            check_url("FIELDSYNC_LOCAL_URL", url)?;
        }
        let tenant_id = non_empty("FIELDSYNC_TENANT_ID")
            .map(TenantId::new)
            .transpose()
            .map_err(|e| ConfigError::Invalid {
                var: "FIELDSYNC_TENANT_ID",
                reason: e.to_string(),
            })?;
        let data_dir = non_empty("FIELDSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DATA_DIR_DEFAULT));

        let connect_ms = bounded(
            "FIELDSYNC_PROBE_CONNECT_TIMEOUT_MS",
            100,
            10_000,
            CONNECT_TIMEOUT_MS_DEFAULT,
        );
        let probe_read_ms = bounded(
            "FIELDSYNC_PROBE_READ_TIMEOUT_MS",
            100,
            10_000,
            PROBE_READ_TIMEOUT_MS_DEFAULT,
        );
        let request_ms = bounded(
            "FIELDSYNC_REQUEST_TIMEOUT_MS",
            100,
            120_000,
            REQUEST_TIMEOUT_MS_DEFAULT,
        );
        let base_ms = bounded(
            "FIELDSYNC_BACKOFF_BASE_MS",
            100,
            600_000,
            BACKOFF_BASE_MS_DEFAULT,
        );
        let ceiling_ms = bounded(
            "FIELDSYNC_BACKOFF_CEILING_MS",
            1_000,
            86_400_000,
            BACKOFF_CEILING_MS_DEFAULT,
        )
        .max(base_ms);
        let digest_iterations = bounded(
            "FIELDSYNC_DIGEST_ITERATIONS",
            u64::from(DIGEST_MIN_ITERATIONS),
            u64::from(DIGEST_MAX_ITERATIONS),
            u64::from(DIGEST_DEFAULT_ITERATIONS),
        ) as u32;
        let expiry_margin_ms = bounded(
            "FIELDSYNC_EXPIRY_MARGIN_MS",
            0,
            3_600_000,
            EXPIRY_MARGIN_MS_DEFAULT,
        );

        Ok(Self {
            data_dir,
            remote_url,
            local_url,
            tenant_id,
            probe_timeouts: HttpTimeouts {
                connect_ms,
                read_ms: probe_read_ms,
            },
            request_timeouts: HttpTimeouts {
                connect_ms,
                read_ms: request_ms,
            },
            backoff: BackoffPolicy {
                base_ms,
                ceiling_ms,
            },
            digest_iterations,
            expiry_margin_ms,
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE_NAME)
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.data_dir.join(MASTER_KEY_FILE_NAME)
    }
}

fn check_url(var: &'static str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            var,
            reason: "must start with http:// or https://".to_string(),
        })
    }
}
