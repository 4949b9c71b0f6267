#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use fieldsync_adapter::{
    error_response, AdapterErrorResponse, AdapterRuntime, LoginAdapterRequest,
    LogoutAdapterQuery, MutationAdapterRequest,
};
use fieldsync_os::RuntimeError;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

type Shared = Arc<AdapterRuntime>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_env("FIELDSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bind = env::var("FIELDSYNC_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8787".to_string());
    let addr: SocketAddr = bind.parse()?;
    let sync_interval_ms = parse_sync_interval_ms_from_env();

    let cancel = CancellationToken::new();
    let runtime: Shared = Arc::new(AdapterRuntime::from_env(cancel.clone())?);

    let worker = tokio::spawn(run_sync_worker(runtime.clone(), cancel.clone(), sync_interval_ms));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(status))
        .route("/v1/login", post(login))
        .route("/v1/logout", post(logout))
        .route("/v1/mutations", post(record_mutation))
        .route("/v1/sync", post(sync_now))
        .route("/v1/mutations/failed", get(failed).delete(purge_failed))
        .route("/v1/mutations/failed/:id", delete(discard_failed))
        .with_state(runtime);

    info!(%addr, sync_interval_ms, "fieldsync_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("ctrl-c handler unavailable; waiting for cancellation");
                shutdown.cancelled().await;
                return;
            }
            info!("shutdown requested");
            shutdown.cancel();
        })
        .await?;
    cancel.cancel();
    if let Err(err) = worker.await {
        error!(error = %err, "sync worker task failed");
    }
    Ok(())
}

fn parse_sync_interval_ms_from_env() -> u64 {
    env::var("FIELDSYNC_SYNC_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| (1_000..=3_600_000).contains(v))
        .unwrap_or(30_000)
}

async fn run_sync_worker(runtime: Shared, cancel: CancellationToken, interval_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let rt = runtime.clone();
        match tokio::task::spawn_blocking(move || rt.run_sync_worker_tick(None)).await {
            Ok(Ok(Some(report))) => info!(
                applied = report.applied_count,
                failed = report.failed_count,
                remaining = report.remaining_count,
                halt = ?report.halt,
                "background sync pass"
            ),
            Ok(Ok(None)) => {}
            Ok(Err(err)) => warn!(error = %err, "background sync pass failed"),
            Err(err) => error!(error = %err, "background sync pass panicked"),
        }
    }
    info!("sync worker stopped");
}

/// Runs a blocking adapter call off the reactor.
async fn blocking<T, F>(runtime: Shared, f: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&AdapterRuntime) -> Result<T, (u16, AdapterErrorResponse)> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(runtime.as_ref())).await {
        Ok(Ok(body)) => (StatusCode::OK, Json(body)).into_response(),
        Ok(Err((code, body))) => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(body),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "adapter task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn mapped<T>(result: Result<T, RuntimeError>) -> Result<T, (u16, AdapterErrorResponse)> {
    result.map_err(|e| error_response(&e))
}

async fn healthz(State(runtime): State<Shared>) -> Response {
    blocking(runtime, |rt| Ok(rt.health_report())).await
}

async fn status(State(runtime): State<Shared>) -> Response {
    blocking(runtime, |rt| mapped(rt.status())).await
}

async fn login(State(runtime): State<Shared>, Json(request): Json<LoginAdapterRequest>) -> Response {
    blocking(runtime, move |rt| mapped(rt.login(request))).await
}

async fn logout(
    State(runtime): State<Shared>,
    Query(query): Query<LogoutAdapterQuery>,
) -> Response {
    blocking(runtime, move |rt| mapped(rt.logout(query.wipe))).await
}

async fn record_mutation(
    State(runtime): State<Shared>,
    Json(request): Json<MutationAdapterRequest>,
) -> Response {
    blocking(runtime, move |rt| rt.record_mutation(request)).await
}

async fn sync_now(State(runtime): State<Shared>) -> Response {
    blocking(runtime, |rt| mapped(rt.sync_now(None))).await
}

async fn failed(State(runtime): State<Shared>) -> Response {
    blocking(runtime, |rt| mapped(rt.failed_mutations())).await
}

async fn purge_failed(State(runtime): State<Shared>) -> Response {
    blocking(runtime, |rt| mapped(rt.purge_failed())).await
}

async fn discard_failed(State(runtime): State<Shared>, Path(id): Path<String>) -> Response {
    blocking(runtime, move |rt| rt.discard_failed(&id)).await
}
