//! CDS Command Executor - runs blueprint scripts inside per-blueprint Python
//! environments on behalf of the blueprint processor.
//!
//! The executor is responsible for:
//! - Preparing an isolated environment per blueprint and installing its
//!   declared pip and ansible-galaxy dependencies exactly once
//! - Running blueprint commands with a timeout, killing the whole process
//!   group when it expires
//! - Splitting command output into log lines, a structured payload and
//!   error messages
//!
//! # Architecture
//!
//! Requests arrive as JSON-RPC 2.0 lines on stdin and are handled
//! concurrently, bounded by `CDS_MAX_WORKERS`. Responses are written to stdout
//! in completion order and matched to requests by id. Handled failures are
//! ordinary `FAILURE` responses; the executor stays up for later requests.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod blueprint;
mod config;
mod environment;
mod error;
mod executor;
mod framer;
mod handler;
mod locks;
mod multipart;
mod response;
mod rpc;
#[cfg(test)]
mod testing;

use config::Config;
use executor::SystemLauncher;
use handler::CommandExecutorHandler;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("cds_command_executor=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = Config::from_env()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        deploy_dir = %config.deploy_dir.display(),
        max_workers = config.max_workers,
        "CDS command executor starting"
    );

    if let Err(e) = serve(config).await {
        error!(error = %e, "Command executor encountered fatal error");
        std::process::exit(1);
    }

    info!("CDS command executor stopped");
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let workers = Arc::new(Semaphore::new(config.max_workers));
    let handler = Arc::new(CommandExecutorHandler::new(config, Arc::new(SystemLauncher)));
    let mut rpc = rpc::RpcHandler::new(tokio::io::stdin(), tokio::io::stdout());

    let (response_tx, mut response_rx) = mpsc::channel::<rpc::Response>(100);
    let mut in_flight = JoinSet::new();
    let mut accepting = true;

    info!("Ready to accept requests");

    loop {
        tokio::select! {
            request_res = rpc.read_request(), if accepting => {
                match request_res {
                    Ok(Some(request)) => {
                        let handler = handler.clone();
                        let workers = workers.clone();
                        let tx = response_tx.clone();
                        in_flight.spawn(async move {
                            let Ok(_permit) = workers.acquire_owned().await else {
                                return;
                            };
                            if let Some(response) = run_request(handler, request).await {
                                let _ = tx.send(response).await;
                            }
                        });
                    }
                    Ok(None) => {
                        info!(in_flight = in_flight.len(), "EOF received, draining in-flight requests");
                        accepting = false;
                    }
                    Err(e) => match e.downcast_ref::<serde_json::Error>() {
                        Some(malformed) => {
                            warn!(error = %malformed, "Rejecting malformed request");
                            rpc.send_response(rpc::malformed_request(malformed)).await?;
                        }
                        None => return Err(e.context("Failed to read request")),
                    },
                }
            }
            _ = tokio::signal::ctrl_c(), if accepting => {
                info!(in_flight = in_flight.len(), "Interrupt received, draining in-flight requests");
                accepting = false;
            }
            Some(response) = response_rx.recv() => {
                rpc.send_response(response).await?;
            }
            Some(joined) = in_flight.join_next() => {
                if let Err(e) = joined {
                    error!(error = %e, "Request task failed");
                }
            }
        }

        if !accepting && in_flight.is_empty() {
            break;
        }
    }

    // Every task sends before it finishes, so the channel now holds the rest.
    while let Ok(response) = response_rx.try_recv() {
        rpc.send_response(response).await?;
    }
    Ok(())
}

/// Handle one request on its own task so a panic turns into a `FAILURE`
/// response instead of a missing one.
async fn run_request(handler: Arc<CommandExecutorHandler>, request: rpc::Request) -> Option<rpc::Response> {
    let id = request.id.clone();
    let request_id = request
        .params
        .get("requestId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match tokio::spawn(dispatch(handler.clone(), request)).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, request_id = %request_id, "Request handler panicked");
            let output = handler.internal_failure(&request_id, &format!("Internal error while handling request {request_id}"));
            let id = id?;
            Some(match serde_json::to_value(output) {
                Ok(value) => rpc::Response::success(id, value),
                Err(e) => rpc::Response::error(id, rpc::INTERNAL_ERROR, &e.to_string()),
            })
        }
    }
}

async fn dispatch(handler: Arc<CommandExecutorHandler>, request: rpc::Request) -> Option<rpc::Response> {
    let result = match request.method.as_str() {
        rpc::METHOD_PREPARE_ENV => match serde_json::from_value::<rpc::PrepareEnvInput>(request.params) {
            Ok(input) => encode(handler.prepare_env(input).await),
            Err(e) => Err((rpc::INVALID_PARAMS, e.to_string())),
        },
        rpc::METHOD_EXECUTE_COMMAND => match serde_json::from_value::<rpc::ExecutionInput>(request.params) {
            Ok(input) => encode(handler.execute_command(input).await),
            Err(e) => Err((rpc::INVALID_PARAMS, e.to_string())),
        },
        other => {
            warn!(method = other, "Unknown method");
            Err((rpc::METHOD_NOT_FOUND, "Method not found".to_string()))
        }
    };

    // Notifications get no reply.
    let id = request.id?;
    Some(match result {
        Ok(value) => rpc::Response::success(id, value),
        Err((code, message)) => rpc::Response::error(id, code, &message),
    })
}

fn encode(output: rpc::ExecutionOutput) -> Result<Value, (i32, String)> {
    serde_json::to_value(output).map_err(|e| (rpc::INTERNAL_ERROR, e.to_string()))
}
