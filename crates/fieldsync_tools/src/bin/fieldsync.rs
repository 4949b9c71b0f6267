#![forbid(unsafe_code)]

use std::io::{self, IsTerminal, Read};

use clap::Parser;
use fieldsync_contracts::UnixMs;
use fieldsync_os::{FieldSyncConfig, FieldSyncRuntime};
use fieldsync_tools::operator_cli::{execute_operator_command, OperatorCommand};
use tracing_subscriber::EnvFilter;

/// Operator tooling for the on-device FieldSync store.
#[derive(Debug, Parser)]
#[command(name = "fieldsync", version)]
struct Cli {
    #[command(subcommand)]
    command: OperatorCommand,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let filter =
        EnvFilter::try_from_env("FIELDSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let password = match cli.command.login_email() {
        Some(email) => Some(read_password(email)?),
        None => None,
    };

    let config = FieldSyncConfig::from_env().map_err(|e| e.to_string())?;
    let runtime = FieldSyncRuntime::open(&config).map_err(|e| e.to_string())?;
    let output =
        execute_operator_command(&runtime, &cli.command, password.as_deref(), UnixMs::now())?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn read_password(email: &str) -> Result<String, String> {
    if io::stdin().is_terminal() {
        let value =
            rpassword::prompt_password(format!("Password for {email}: ")).map_err(|e| e.to_string())?;
        if value.is_empty() {
            return Err("password must not be empty".to_string());
        }
        Ok(value)
    } else {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| e.to_string())?;
        let value = input.trim_end_matches(['\r', '\n']).to_string();
        if value.is_empty() {
            return Err("password must not be empty".to_string());
        }
        Ok(value)
    }
}
