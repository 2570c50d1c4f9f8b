//! Execution results and their wire representation.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::TruncatePolicy;
use crate::rpc::{ExecutionOutput, Status, ENVELOPE_RESERVE};

/// Payload key carrying the error text, read by the upstream processor.
pub const ERR_MSG_KEY: &str = "err_msg";
/// Payload key telling the upstream processor to upload the archive again.
pub const REUPLOAD_CBA_KEY: &str = "reupload_cba";

const TRUNCATED_PREFIX: &str = "[...] TRUNCATED CHARS : ";

/// Outcome of one `prepareEnv` or `executeCommand` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Success {
        log: Vec<String>,
        payload: Map<String, Value>,
    },
    Failure {
        log: Vec<String>,
        payload: Map<String, Value>,
        error: String,
        reupload_required: bool,
    },
}

impl ExecutionResult {
    pub fn success(log: Vec<String>, payload: Map<String, Value>) -> Self {
        Self::Success { log, payload }
    }

    pub fn failure(log: Vec<String>, error: impl Into<String>) -> Self {
        Self::Failure {
            log,
            payload: Map::new(),
            error: error.into(),
            reupload_required: false,
        }
    }

    pub fn reupload(error: impl Into<String>) -> Self {
        Self::Failure {
            log: Vec::new(),
            payload: Map::new(),
            error: error.into(),
            reupload_required: true,
        }
    }

    pub fn with_payload(mut self, extra: Map<String, Value>) -> Self {
        match &mut self {
            Self::Success { payload, .. } | Self::Failure { payload, .. } => payload.extend(extra),
        }
        self
    }
}

/// Turns results into size-bounded `ExecutionOutput` messages.
#[derive(Debug, Clone, Copy)]
pub struct ResponseBuilder {
    max_size: usize,
    policy: TruncatePolicy,
}

impl ResponseBuilder {
    pub fn new(max_size: usize, policy: TruncatePolicy) -> Self {
        Self { max_size, policy }
    }

    pub fn build(&self, request_id: &str, result: ExecutionResult) -> ExecutionOutput {
        let (status, log, payload, err_msg) = match result {
            ExecutionResult::Success { log, payload } => (Status::Success, log, payload, String::new()),
            ExecutionResult::Failure {
                log,
                mut payload,
                error,
                reupload_required,
            } => {
                payload.insert(ERR_MSG_KEY.to_string(), Value::from(error.clone()));
                if reupload_required {
                    payload.insert(REUPLOAD_CBA_KEY.to_string(), Value::Bool(true));
                }
                (Status::Failure, log, payload, error)
            }
        };

        let mut output = ExecutionOutput {
            request_id: request_id.to_string(),
            response: log,
            status,
            payload: Value::Object(payload).to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            err_msg,
        };
        self.truncate(&mut output);
        output
    }

    /// Drop log lines until the serialized message fits, then append one
    /// summary line with the number of characters removed.
    ///
    /// The budget is the wire ceiling minus [`ENVELOPE_RESERVE`].
    fn truncate(&self, output: &mut ExecutionOutput) {
        let limit = self.max_size.saturating_sub(ENVELOPE_RESERVE);
        let mut size = encoded_len(&*output);
        if size <= limit {
            return;
        }

        let summary_cost = encoded_len(&summary(usize::MAX)) + 1;
        let mut dropped = 0;
        let mut chars = 0;
        {
            let ordered: Box<dyn Iterator<Item = &String> + '_> = match self.policy {
                TruncatePolicy::DropNewest => Box::new(output.response.iter().rev()),
                TruncatePolicy::DropOldest => Box::new(output.response.iter()),
            };
            for line in ordered {
                if size + summary_cost <= limit {
                    break;
                }
                size = size.saturating_sub(encoded_len(line) + 1);
                chars += line.chars().count();
                dropped += 1;
            }
        }
        self.remove_lines(&mut output.response, dropped);
        output.response.push(summary(chars));

        // The estimate above is exact up to separators; settle any remainder.
        while encoded_len(&*output) > limit && output.response.len() > 1 {
            output.response.pop();
            self.remove_lines(&mut output.response, 1).into_iter().for_each(|line| {
                chars += line.chars().count();
            });
            output.response.push(summary(chars));
        }

        if encoded_len(&*output) > limit {
            warn!(
                max_size = self.max_size,
                payload_len = output.payload.len(),
                "Response still exceeds the size limit after dropping every log line"
            );
        }
    }

    fn remove_lines(&self, lines: &mut Vec<String>, count: usize) -> Vec<String> {
        let count = count.min(lines.len());
        match self.policy {
            TruncatePolicy::DropNewest => lines.split_off(lines.len() - count),
            TruncatePolicy::DropOldest => lines.drain(..count).collect(),
        }
    }
}

fn summary(chars: usize) -> String {
    format!("{TRUNCATED_PREFIX}{chars}")
}

/// Byte length of `value` once serialized as JSON.
fn encoded_len<T: Serialize + ?Sized>(value: &T) -> usize {
    struct Counter(usize);

    impl std::io::Write for Counter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0 += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let mut counter = Counter(0);
    match serde_json::to_writer(&mut counter, value) {
        Ok(()) => counter.0,
        Err(_) => usize::MAX,
    }
}
