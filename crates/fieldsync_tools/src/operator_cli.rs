#![forbid(unsafe_code)]

use clap::Subcommand;
use fieldsync_contracts::{MutationId, UnixMs};
use fieldsync_os::{FieldSyncRuntime, RuntimeError};
use tokio_util::sync::CancellationToken;

/// Operator commands. Sessions live only for the duration of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum OperatorCommand {
    /// Authenticate through the tier cascade and report which tier answered.
    Login { email: String },
    /// Show ledger counts.
    Status,
    /// Authenticate, then drain the mutation ledger once.
    Sync { email: String },
    /// List mutations parked as permanently failed.
    Failed,
    /// Discard one permanently failed mutation.
    Discard { id: String },
    /// Discard every permanently failed mutation.
    Purge,
    /// Drop applied mutations from the ledger.
    Compact,
    /// Authenticate, then end the session and remove this user's cached credentials.
    LogoutAndWipe { email: String },
    /// Remove every cached credential from this device.
    ForgetDevice,
}

impl OperatorCommand {
    /// Email of the account this command authenticates, if it needs a password.
    pub fn login_email(&self) -> Option<&str> {
        match self {
            Self::Login { email } | Self::Sync { email } | Self::LogoutAndWipe { email } => {
                Some(email.as_str())
            }
            _ => None,
        }
    }
}

pub fn execute_operator_command(
    runtime: &FieldSyncRuntime,
    command: &OperatorCommand,
    password: Option<&str>,
    now: UnixMs,
) -> Result<String, String> {
    match command {
        OperatorCommand::Login { email } => {
            let session = runtime
                .login(email, require_password(password)?, now)
                .map_err(describe)?;
            let note = if session.is_degraded() {
                " (offline: remote writes will be queued for later)"
            } else {
                ""
            };
            Ok(format!(
                "authenticated {} via {}{note}",
                session.user_id.as_str(),
                session.source_tier
            ))
        }
        OperatorCommand::Status => {
            let status = runtime.status().map_err(describe)?;
            serde_json::to_string_pretty(&status.ledger).map_err(|e| e.to_string())
        }
        OperatorCommand::Sync { email } => {
            let session = runtime
                .login(email, require_password(password)?, now)
                .map_err(describe)?;
            let report = runtime
                .drain(now, &CancellationToken::new())
                .map_err(describe)?;
            let halt = match report.halt {
                Some(halt) => {
                    let name = serde_json::to_value(halt).map_err(|e| e.to_string())?;
                    format!(" halted={}", name.as_str().unwrap_or("UNKNOWN"))
                }
                None => String::new(),
            };
            Ok(format!(
                "via {}: applied={} failed={} remaining={}{halt}",
                session.source_tier,
                report.applied_count,
                report.failed_count,
                report.remaining_count
            ))
        }
        OperatorCommand::Failed => {
            let records = runtime.failed_mutations().map_err(describe)?;
            Ok(records
                .iter()
                .map(|r| {
                    format!(
                        "{}\t{}\t{}\t{}\t{}",
                        r.id,
                        r.sequence,
                        r.operation_kind.as_str(),
                        r.target_resource.as_str(),
                        r.last_error.as_deref().unwrap_or("-")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        OperatorCommand::Discard { id } => {
            let id = MutationId::parse(id).map_err(|e| e.to_string())?;
            runtime.discard_failed(id).map_err(describe)?;
            Ok("OK".to_string())
        }
        OperatorCommand::Purge => {
            let removed = runtime.purge_failed().map_err(describe)?;
            Ok(format!("purged {removed}"))
        }
        OperatorCommand::Compact => {
            let removed = runtime.compact().map_err(describe)?;
            Ok(format!("compacted {removed}"))
        }
        OperatorCommand::LogoutAndWipe { email } => {
            runtime
                .login(email, require_password(password)?, now)
                .map_err(describe)?;
            match runtime.logout_and_wipe().map_err(describe)? {
                Some(session) => Ok(format!(
                    "logged out {} and wiped cached credentials",
                    session.user_id.as_str()
                )),
                None => Ok("no session".to_string()),
            }
        }
        OperatorCommand::ForgetDevice => {
            let removed = runtime.forget_device().map_err(describe)?;
            Ok(format!("forgot {removed} cached credential(s)"))
        }
    }
}

fn require_password(password: Option<&str>) -> Result<&str, String> {
    password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| "missing password input".to_string())
}

fn describe(err: RuntimeError) -> String {
    match &err {
        RuntimeError::Auth(auth) => match auth.tier() {
            Some(tier) => format!("{err} [{tier}]"),
            None => err.to_string(),
        },
        _ => err.to_string(),
    }
}
