//! Test doubles shared by the module test suites.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;

use crate::executor::{ProcessLauncher, ProcessOutput, ProcessSpec};

/// Launcher that records every spec and pretends installers succeed.
///
/// A `python -m venv <root>` call lays out `bin/python` and a
/// `site-packages` directory so later steps find a usable runtime.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    calls: Mutex<Vec<ProcessSpec>>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any invocation whose arguments contain `needle`.
    pub fn failing_on(self, needle: &str) -> Self {
        *self.fail_on.lock().unwrap() = Some(needle.to_string());
        self
    }

    pub fn clear_failure(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<ProcessSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn installed(&self, package: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|spec| spec.args.iter().any(|arg| arg == package))
    }
}

#[async_trait]
impl ProcessLauncher for RecordingLauncher {
    async fn output(&self, spec: &ProcessSpec) -> std::io::Result<ProcessOutput> {
        self.calls.lock().unwrap().push(spec.clone());

        let failing = self
            .fail_on
            .lock()
            .unwrap()
            .clone()
            .filter(|needle| spec.args.iter().any(|arg| arg == needle));
        if let Some(needle) = failing {
            return Ok(ProcessOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: format!("could not install {needle}\n"),
            });
        }

        if spec.args.iter().any(|arg| arg == "venv") {
            if let Some(root) = spec.args.last() {
                let root = Path::new(root);
                std::fs::create_dir_all(root.join("bin"))?;
                std::fs::write(root.join("bin/python"), "")?;
                std::fs::create_dir_all(root.join("lib/python3.11/site-packages"))?;
            }
        }

        Ok(ProcessOutput {
            code: Some(0),
            stdout: format!("ran {}\n", spec.display()),
            stderr: String::new(),
        })
    }
}
