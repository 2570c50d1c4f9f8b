//! Request handling for `prepareEnv` and `executeCommand`.
//!
//! The handler validates the blueprint artifact, makes the environment ready
//! under the blueprint's lock, runs the command and frames the result. Every
//! failure comes back as an `ExecutionOutput` with status `FAILURE`.

use serde_json::Map;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::blueprint::BlueprintLayout;
use crate::config::Config;
use crate::environment::EnvironmentManager;
use crate::error::{EnvError, RunError};
use crate::executor::{CommandRunner, IdentityEnv, ProcessLauncher};
use crate::locks::IdentityLocks;
use crate::response::{ExecutionResult, ResponseBuilder};
use crate::rpc::{ExecutionInput, ExecutionOutput, PrepareEnvInput, RequestHeader};

/// Shared state behind every request.
pub struct CommandExecutorHandler {
    config: Config,
    environments: EnvironmentManager,
    runner: CommandRunner,
    locks: IdentityLocks,
    responses: ResponseBuilder,
}

impl CommandExecutorHandler {
    pub fn new(config: Config, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let environments = EnvironmentManager::new(
            config.python_bin.clone(),
            config.utility_package_dir.clone(),
            launcher,
        );
        let responses = ResponseBuilder::new(config.response_max_size, config.truncate_policy);
        Self {
            config,
            environments,
            runner: CommandRunner::new(),
            locks: IdentityLocks::new(),
            responses,
        }
    }

    /// Handle a `prepareEnv` request.
    pub async fn prepare_env(&self, input: PrepareEnvInput) -> ExecutionOutput {
        let span = request_span(&input.header);
        let request_id = input.header.request_id.clone();
        let result = self.prepare_environment(&input).instrument(span).await;
        self.responses.build(&request_id, result)
    }

    /// Handle an `executeCommand` request.
    pub async fn execute_command(&self, input: ExecutionInput) -> ExecutionOutput {
        let span = request_span(&input.header);
        let request_id = input.header.request_id.clone();
        let result = self.execute(&input).instrument(span).await;
        self.responses.build(&request_id, result)
    }

    /// Build a failure response for a request that could not be handled.
    pub fn internal_failure(&self, request_id: &str, message: &str) -> ExecutionOutput {
        self.responses
            .build(request_id, ExecutionResult::failure(Vec::new(), message))
    }

    fn layout(&self, header: &RequestHeader) -> BlueprintLayout {
        BlueprintLayout::new(&self.config.deploy_dir, header.identifiers.blueprint_id())
    }

    /// Make the blueprint environment ready without running anything.
    pub async fn prepare_environment(&self, input: &PrepareEnvInput) -> ExecutionResult {
        let layout = self.layout(&input.header);
        if let Err(e) = layout.validate_artifact() {
            return artifact_failure(e);
        }
        info!("CBA directory exists on cmd-exec");

        let mut log = Vec::new();
        let _guard = self.locks.acquire(layout.root()).await;
        match self
            .environments
            .ensure_environment(&layout, &input.packages, &mut log)
            .await
        {
            Ok(readiness) => {
                debug!(?readiness, "Environment ready");
                ExecutionResult::success(log, Map::new())
            }
            Err(e) => ExecutionResult::failure(
                log,
                format!("failed to prepare environment for request {}: {e}", layout.id()),
            ),
        }
    }

    /// Ensure a runtime exists, run the command, and collect its output.
    ///
    /// Only the runtime and helper package are set up here; declared
    /// dependencies and the ready marker belong to `prepare_environment`.
    pub async fn execute(&self, input: &ExecutionInput) -> ExecutionResult {
        let layout = self.layout(&input.header);
        if let Err(e) = layout.validate_artifact() {
            return artifact_failure(e);
        }

        {
            let mut install_log = Vec::new();
            let _guard = self.locks.acquire(layout.root()).await;
            if let Err(e) = self
                .environments
                .ensure_runtime(&layout, &mut install_log)
                .await
            {
                return ExecutionResult::failure(
                    install_log,
                    format!("{} - Failed to execute command during environment setup: {e}", layout.id()),
                );
            }
            debug!(lines = install_log.len(), "Environment ready for command");
        }

        touch(&layout).await;

        let timeout = match input.header.time_out {
            0 => self.config.default_timeout,
            secs => Duration::from_secs(secs),
        };
        let identity = IdentityEnv {
            request_id: input.header.request_id.clone(),
            sub_request_id: input.header.sub_request_id.clone(),
            originator_id: input.header.originator_id.clone(),
            correlation_id: input.header.correlation_id.clone(),
        };
        info!(timeout_secs = timeout.as_secs(), "Running blueprint command");

        let outcome = match self
            .runner
            .run(&layout, &input.command, &input.properties, &identity, timeout)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Command could not be run");
                return ExecutionResult::failure(
                    Vec::new(),
                    format!("{} - Failed to execute command. Error: {e}", layout.id()),
                );
            }
        };

        let output = outcome.output;
        match outcome.error {
            None => {
                if !output.error_messages.is_empty() {
                    warn!(
                        messages = ?output.error_messages,
                        "Command succeeded but reported error messages"
                    );
                }
                ExecutionResult::success(output.results_log, output.payload)
            }
            Some(err) => {
                let mut message = match &err {
                    RunError::Timeout { .. } => format!(
                        "Running command {} failed due to timeout of {} seconds.",
                        layout.id(),
                        timeout.as_secs()
                    ),
                    other => format!("{} - {other}", layout.id()),
                };
                for extra in &output.error_messages {
                    message.push('\n');
                    message.push_str(extra);
                }
                error!(error = %err, elapsed_ms = outcome.elapsed.as_millis() as u64, "Command failed");
                ExecutionResult::failure(output.results_log, message).with_payload(output.payload)
            }
        }
    }
}

fn artifact_failure(e: EnvError) -> ExecutionResult {
    info!(error = %e, "Blueprint artifact missing");
    if e.reupload_required() {
        ExecutionResult::reupload(e.to_string())
    } else {
        ExecutionResult::failure(Vec::new(), e.to_string())
    }
}

fn request_span(header: &RequestHeader) -> tracing::Span {
    info_span!(
        "request",
        blueprint = %header.identifiers.blueprint_id(),
        request_id = %header.request_id,
        subrequest_id = %header.sub_request_id,
        originator_id = %header.originator_id,
    )
}

/// Bump the blueprint directory's mtime to mark it as recently used.
async fn touch(layout: &BlueprintLayout) {
    let root = layout.root().to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::fs::File::open(&root).and_then(|dir| dir.set_modified(SystemTime::now()))
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Could not update blueprint directory mtime"),
        Err(e) => warn!(error = %e, "Blueprint directory touch task failed"),
    }
}
