//! Error taxonomy for environment provisioning and command execution.
//!
//! Every variant here is a handled failure: the handler converts it into a
//! `FAILURE` response instead of letting it reach the transport.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures while making a blueprint environment ready.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The blueprint directory or its TOSCA meta file is absent.
    #[error("{reason}")]
    ArtifactMissing { reason: String },

    /// An identifier part cannot be used as a single path component.
    #[error("invalid blueprint {field} {value:?}: must be a single non-empty path component")]
    InvalidIdentifier { field: &'static str, value: String },

    /// The isolated runtime could not be materialized.
    #[error("failed to create Python environment at {}: {message}", path.display())]
    EnvCreation { path: PathBuf, message: String },

    /// A single dependency failed; the install sequence was aborted.
    #[error("failed to install package '{package}': {stderr}")]
    PackageInstall { package: String, stderr: String },

    /// Reading or writing the installed marker failed.
    #[error("installed marker {} is unusable: {source}", path.display())]
    Marker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EnvError {
    /// Whether the caller must re-upload the blueprint before retrying.
    pub fn reupload_required(&self) -> bool {
        matches!(self, EnvError::ArtifactMissing { .. })
    }
}

/// Failures while running a command inside a ready environment.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("command timed out after {} seconds", elapsed.as_secs())]
    Timeout { elapsed: Duration },

    #[error("command exited with code {exit_code}")]
    CommandExecution { exit_code: i32 },

    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to capture command output: {0}")]
    Spool(#[source] std::io::Error),

    #[error("failed to serialize command properties: {0}")]
    Properties(String),
}

/// Diagnostics raised while demultiplexing captured output. These are logged,
/// never returned to the caller.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("{section} section opened but never closed ({lines} lines dropped)")]
    MalformedOutputSection { section: &'static str, lines: usize },

    #[error("extra payload section could not be decoded: {0}")]
    Payload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_missing_artifact_requires_reupload() {
        let missing = EnvError::ArtifactMissing {
            reason: "gone".to_string(),
        };
        let install = EnvError::PackageInstall {
            package: "ncclient".to_string(),
            stderr: "no such package".to_string(),
        };

        let invalid = EnvError::InvalidIdentifier {
            field: "blueprintName",
            value: "..".to_string(),
        };

        assert!(missing.reupload_required());
        assert!(!install.reupload_required());
        assert!(!invalid.reupload_required());
    }

    #[test]
    fn test_timeout_message_reports_seconds() {
        let err = RunError::Timeout {
            elapsed: Duration::from_millis(3_200),
        };
        assert_eq!(err.to_string(), "command timed out after 3 seconds");
    }

    #[test]
    fn test_wait_failure_is_not_reported_as_spawn() {
        let err = RunError::Wait(std::io::Error::new(std::io::ErrorKind::Interrupted, "reaped elsewhere"));
        assert_eq!(err.to_string(), "failed to wait for command: reaped elsewhere");
        assert!(!matches!(err, RunError::Spawn(_)));
    }
}
